use super::admin::{allow_all, require_token, Authorizer};
use super::core::EndpointCore;
use super::Endpoint;
use crate::codec::{CborCodec, Codec};
use crate::config::EndpointConfig;
use crate::err::*;
use crate::registry::{Registry, Resolver};
use crate::stopper::EndpointStopper;
use crate::transport::{Address, Transport};
use std::sync::Arc;

/// Configures and starts an endpoint.
/// ```ignore
/// let mut registry = Registry::new();
/// registry.register_blocking("math.add", |inv| Ok((inv.arg::<i64>(0)? + inv.arg::<i64>(1)?).into()))?;
///
/// let transport = t2_rpc::transport::udp::bind("127.0.0.1:4242").await?;
/// let (endpoint, stopper) = EndpointBuilder::new()
///     .resolver(registry)
///     .start(transport)?;
/// ```
pub struct EndpointBuilder<A: Address, C: Codec = CborCodec> {
    config: EndpointConfig,
    codec: C,
    resolver: Arc<dyn Resolver>,
    authorizer: Option<Authorizer<A>>,
}

impl<A: Address> Default for EndpointBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Address> EndpointBuilder<A> {
    pub fn new() -> Self {
        EndpointBuilder {
            config: EndpointConfig::default(),
            codec: CborCodec,
            resolver: Arc::new(Registry::new()),
            authorizer: None,
        }
    }
}

impl<A: Address, C: Codec> EndpointBuilder<A, C> {
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codec<TCodec: Codec>(self, codec: TCodec) -> EndpointBuilder<A, TCodec> {
        EndpointBuilder {
            config: self.config,
            codec,
            resolver: self.resolver,
            authorizer: self.authorizer,
        }
    }

    /// Where inbound requests find their handlers. Without one the endpoint is a pure client and
    /// answers every request with `HandlerNotFound`.
    pub fn resolver(mut self, resolver: impl Resolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Decide which `SHUTDOWN` frames are obeyed. Defaults to requiring the configured
    /// `admin_token`, or to allowing everything if none is configured.
    pub fn authorizer(mut self, authorizer: impl Fn(&A, &[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Spawn the endpoint on `transport`. Must be called from within a tokio runtime.
    pub fn start<TTransport: Transport<A>>(
        self,
        transport: TTransport,
    ) -> RpcResult<(Endpoint<A>, EndpointStopper<A>)> {
        self.config.validate()?;

        let authorizer = match self.authorizer {
            Some(authorizer) => authorizer,
            None => match &self.config.admin_token {
                Some(token) => require_token(token.as_bytes()),
                None => allow_all(),
            },
        };

        let (command_sender, command_receiver) = tokio::sync::mpsc::unbounded_channel();

        let core = EndpointCore::new(
            transport,
            self.codec,
            self.config,
            self.resolver,
            authorizer,
            command_sender.downgrade(),
            command_receiver,
        );
        let join_handle = core.spawn();

        let endpoint = Endpoint::new(command_sender);
        let stopper = EndpointStopper::new(endpoint.clone(), join_handle);

        Ok((endpoint, stopper))
    }
}
