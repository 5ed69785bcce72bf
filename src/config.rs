use crate::err::*;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 4242;
pub const DEFAULT_MAX_BLOCKING_HANDLERS: usize = 16;

/// Settings of one endpoint. Every field has a default so a config file only needs to name
/// what it changes.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    /// Send a best-effort `CANCEL` to the peer when a call times out, unless the call says otherwise.
    pub cancel_on_timeout: bool,
    /// Pass a call's deadline to the handler as the `timeout` keyword argument (in seconds).
    pub forward_timeout: bool,
    /// How many blocking handlers may run on the worker pool at once.
    pub max_blocking_handlers: usize,
    /// Exit the process after an authorized `SHUTDOWN`. When false the endpoint only closes.
    pub exit_on_shutdown: bool,
    /// Sent with `shutdown()`, and, unless an explicit authorizer is installed, required on
    /// inbound `SHUTDOWN` frames.
    pub admin_token: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            cancel_on_timeout: true,
            forward_timeout: true,
            max_blocking_handlers: DEFAULT_MAX_BLOCKING_HANDLERS,
            exit_on_shutdown: true,
            admin_token: None,
        }
    }
}

impl EndpointConfig {
    pub fn from_json_str(json: &str) -> RpcResult<Self> {
        let config: EndpointConfig =
            serde_json::from_str(json).map_err(|e| RpcError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> RpcResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> RpcResult<()> {
        if self.max_blocking_handlers == 0 {
            return Err(RpcError::ConfigError(
                "max_blocking_handlers must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[test]
fn test_empty_config_is_default() {
    assert_eq!(EndpointConfig::default(), EndpointConfig::from_json_str("{}").unwrap());
}

#[test]
fn test_partial_config() {
    let config =
        EndpointConfig::from_json_str(r#"{"exit_on_shutdown": false, "admin_token": "s3cret"}"#)
            .unwrap();
    assert!(!config.exit_on_shutdown);
    assert_eq!(Some("s3cret".to_string()), config.admin_token);
    assert!(config.cancel_on_timeout);
    assert_eq!(DEFAULT_MAX_BLOCKING_HANDLERS, config.max_blocking_handlers);
}

#[test]
fn test_invalid_config() {
    assert!(matches!(
        EndpointConfig::from_json_str(r#"{"max_blocking_handlers": 0}"#),
        Err(RpcError::ConfigError(_))
    ));
    assert!(matches!(
        EndpointConfig::from_json_str(r#"{"cancel_on_timeout": "yes"}"#),
        Err(RpcError::ConfigError(_))
    ));
}
