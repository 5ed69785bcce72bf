use std::sync::Arc;

/// Decides whether a `SHUTDOWN` frame from `peer` carrying `token` may terminate the endpoint.
pub type Authorizer<A> = Arc<dyn Fn(&A, &[u8]) -> bool + Send + Sync>;

pub fn allow_all<A: 'static>() -> Authorizer<A> {
    Arc::new(|_: &A, _: &[u8]| true)
}

/// Only a `SHUTDOWN` carrying exactly `token` is authorized.
pub fn require_token<A: 'static>(token: impl Into<Vec<u8>>) -> Authorizer<A> {
    let token = token.into();
    Arc::new(move |_: &A, presented: &[u8]| presented == token.as_slice())
}

#[test]
fn test_allow_all() {
    let authorize = allow_all::<String>();
    assert!(authorize(&"a".to_string(), &b""[..]));
}

#[test]
fn test_require_token() {
    let authorize = require_token::<String>("s3cret");
    let peer = "a".to_string();
    assert!(authorize(&peer, &b"s3cret"[..]));
    assert!(!authorize(&peer, &b""[..]));
    assert!(!authorize(&peer, &b"s3cret!"[..]));
}
