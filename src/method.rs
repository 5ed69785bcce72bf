use crate::err::*;
use regex::Regex;

pub const SEPARATOR: char = '.';

lazy_static! {
    static ref RGX_METHOD: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").unwrap();
}

#[test]
fn test_rgx_method() {
    assert!(RGX_METHOD.is_match("a"));
    assert!(RGX_METHOD.is_match("add"));
    assert!(RGX_METHOD.is_match("_private"));
    assert!(RGX_METHOD.is_match("math.add"));
    assert!(RGX_METHOD.is_match("math.v2.Add_1"));

    assert!(!RGX_METHOD.is_match(""));
    assert!(!RGX_METHOD.is_match("0"));
    assert!(!RGX_METHOD.is_match("math."));
    assert!(!RGX_METHOD.is_match(".add"));
    assert!(!RGX_METHOD.is_match("math..add"));
    assert!(!RGX_METHOD.is_match("math.0add"));
    assert!(!RGX_METHOD.is_match("math/add"));
    assert!(!RGX_METHOD.is_match("math.add "));
}

/// Split a dotted method name such as `math.add` into its path fragments.
pub(crate) fn parse_method(method: &str) -> RpcResult<Vec<&str>> {
    if !RGX_METHOD.is_match(method) {
        return Err(RpcError::InvalidMethodName(method.to_string()));
    }

    Ok(method.split(SEPARATOR).collect::<Vec<&str>>())
}

pub fn join_method(prefix: &str, name: &str) -> String {
    match (prefix, name) {
        ("", name) => name.to_string(),
        (prefix, "") => prefix.to_string(),
        _ => format!("{}{}{}", prefix, SEPARATOR, name),
    }
}

#[test]
fn test_parse_method() {
    assert_eq!(vec!["math", "add"], parse_method("math.add").unwrap());
    assert_eq!(vec!["echo"], parse_method("echo").unwrap());
    assert_eq!(
        Err(RpcError::InvalidMethodName("math..add".into())),
        parse_method("math..add")
    );
}

#[test]
fn test_join_method() {
    assert_eq!("math.add", &join_method("math", "add"));
    assert_eq!("add", &join_method("", "add"));
    assert_eq!("math", &join_method("math", ""));
}
