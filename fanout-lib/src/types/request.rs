use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::Value;
use url::Url;

use crate::{ErrorKind, RequestOptions, Result};

/// Body of a request
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Encoded as JSON before sending
    Json(Value),
    /// Sent as is
    Raw(Bytes),
}

impl Payload {
    /// Encode the payload into the bytes that go over the wire
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::EncodeBody`] if the JSON value cannot be encoded.
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            Payload::Json(value) => serde_json::to_vec(&value)
                .map(Bytes::from)
                .map_err(ErrorKind::EncodeBody),
            Payload::Raw(bytes) => Ok(bytes),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Raw(Bytes::from(text))
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Payload::Raw(Bytes::from_static(text.as_bytes()))
    }
}

/// A request as submitted by the caller, before defaults are applied.
///
/// # Examples
///
/// ```
/// use fanout_lib::{RequestDescriptor, RequestOptions};
/// use http::Method;
/// use std::time::Duration;
///
/// let request = RequestDescriptor::try_from("https://example.com/users")
///     .unwrap()
///     .with_method(Method::DELETE)
///     .with_options(RequestOptions {
///         timeout: Some(Duration::from_secs(5)),
///         ..RequestOptions::default()
///     });
/// assert_eq!(request.method, Method::DELETE);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// Absolute target URL
    pub url: Url,
    /// Request method
    pub method: Method,
    /// Per-call headers; these win over the client's default headers
    pub headers: HeaderMap,
    /// Optional body
    pub body: Option<Payload>,
    /// Per-call option overlay
    pub options: RequestOptions,
}

impl RequestDescriptor {
    /// A `GET` request for `url` without headers, body or option overrides
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            options: RequestOptions::default(),
        }
    }

    /// Set the request method
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the per-call headers
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the request body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Payload>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the per-call option overlay
    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

impl TryFrom<&str> for RequestDescriptor {
    type Error = ErrorKind;

    fn try_from(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| ErrorKind::ParseUrl(url.to_string(), e))?;
        Ok(Self::new(url))
    }
}

impl TryFrom<String> for RequestDescriptor {
    type Error = ErrorKind;

    fn try_from(url: String) -> Result<Self> {
        Self::try_from(url.as_str())
    }
}

impl From<Url> for RequestDescriptor {
    fn from(url: Url) -> Self {
        Self::new(url)
    }
}

/// Parse a method name such as `post` or `GET`
///
/// # Errors
///
/// Returns [`ErrorKind::InvalidMethod`] if the name is not a valid token.
pub fn parse_method(name: &str) -> Result<Method> {
    Method::from_bytes(name.to_ascii_uppercase().as_bytes())
        .map_err(|_| ErrorKind::InvalidMethod(name.to_string()))
}

/// Parse a header given as `Name: value`
///
/// # Errors
///
/// Returns an error if there is no colon or the name or value is invalid.
pub fn parse_header(line: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ErrorKind::MalformedHeader(line.to_string()))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())?;
    let value = HeaderValue::from_str(value.trim())?;
    Ok((name, value))
}

/// Merge `over` on top of `base`; a name present in `over` replaces every
/// value `base` has for it.
#[must_use]
pub fn merge_headers(base: &HeaderMap, over: &HeaderMap) -> HeaderMap {
    let mut merged = base.clone();
    for name in over.keys() {
        merged.remove(name);
        for value in over.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT, CONTENT_TYPE};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_json_payload() {
        let bytes = Payload::from(json!({"a": 1})).into_bytes().unwrap();
        assert_eq!(bytes, Bytes::from(r#"{"a":1}"#));
        assert_eq!(
            Payload::Json(Value::Null).into_bytes().unwrap(),
            Bytes::from("null")
        );
    }

    #[test]
    fn test_descriptor_from_invalid_url() {
        assert!(matches!(
            RequestDescriptor::try_from("not a url"),
            Err(ErrorKind::ParseUrl(..))
        ));
    }

    #[rstest]
    #[case("get", Method::GET)]
    #[case("Patch", Method::PATCH)]
    #[case("DELETE", Method::DELETE)]
    fn test_parse_method(#[case] name: &str, #[case] expected: Method) {
        assert_eq!(parse_method(name).unwrap(), expected);
    }

    #[test]
    fn test_parse_invalid_method() {
        assert_eq!(
            parse_method("GE T"),
            Err(ErrorKind::InvalidMethod("GE T".to_string()))
        );
    }

    #[test]
    fn test_parse_header() {
        let (name, value) = parse_header("Accept:  application/json ").unwrap();
        assert_eq!(name, ACCEPT);
        assert_eq!(value, "application/json");
        assert_eq!(
            parse_header("no colon"),
            Err(ErrorKind::MalformedHeader("no colon".to_string()))
        );
    }

    #[test]
    fn test_caller_headers_win() {
        let mut defaults = HeaderMap::new();
        defaults.insert(ACCEPT, HeaderValue::from_static("text/html"));
        defaults.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let mut per_call = HeaderMap::new();
        per_call.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let merged = merge_headers(&defaults, &per_call);
        assert_eq!(merged.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(merged.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(merged.len(), 2);
    }
}
