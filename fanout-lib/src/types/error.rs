use serde::{Serialize, Serializer};
use std::hash::Hash;
use std::{convert::Infallible, path::PathBuf};
use thiserror::Error;
use url::Url;

/// Possible errors when building requests or clients with `fanout_lib`.
///
/// Failures of individual transfers are *not* represented here; they are
/// reported per request as [`crate::TransferError`]. Faults of the driver
/// itself are [`crate::DriverFault`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Any form of I/O error occurred while reading from a given path.
    #[error("Failed to read from path: `{path}`, reason: {1}", path = match .0 {
        Some(p) => p.to_str().unwrap_or("<MALFORMED PATH>"),
        None => "<MALFORMED PATH>",
    })]
    IoError(Option<PathBuf>, std::io::Error),

    /// The given string can not be parsed into a valid URL
    #[error("Cannot parse `{0}` as URL: {1}")]
    ParseUrl(String, url::ParseError),

    /// An URL without a host was used as request target
    #[error("URL is missing a host: {0}")]
    InvalidUrlHost(Url),

    /// Only `http` and `https` can be requested
    #[error("Unsupported URL scheme `{0}`, expected `http` or `https`")]
    UnsupportedScheme(String),

    /// The given header value could not be parsed.
    #[error("Header value could not be parsed")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// The given header name could not be parsed.
    #[error("Header name could not be parsed")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// A header given as `Name: value` string has no colon
    #[error("Header `{0}` is not in `Name: value` format")]
    MalformedHeader(String),

    /// The given HTTP method is not valid
    #[error("Invalid HTTP method: `{0}`")]
    InvalidMethod(String),

    /// A request key is already queued or in flight
    #[error("Request key `{0}` is already queued or in flight")]
    DuplicateKey(String),

    /// The rate limit must allow at least one request per second
    #[error("Rate limit must be at least 1 request per second, got {0}")]
    InvalidRateLimit(u32),

    /// A request body could not be encoded as JSON
    #[error("Cannot encode request body as JSON: {0}")]
    EncodeBody(#[source] serde_json::Error),

    /// The reqwest client of a connection handle could not be created
    #[error("Error creating HTTP client for connection handle: {0}")]
    BuildTransport(#[source] reqwest::Error),

    /// The shared TLS configuration could not be created
    #[error("Error creating TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    /// Cookie jar could not be loaded or saved
    #[error("Cookie jar error: {0}")]
    Cookies(String),

    /// Configuration file is not valid TOML or has unexpected keys
    #[error("Cannot parse configuration: {0}")]
    ParseConfig(#[from] toml::de::Error),
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::IoError(p1, e1), Self::IoError(p2, e2)) => p1 == p2 && e1.kind() == e2.kind(),
            (Self::ParseUrl(s1, e1), Self::ParseUrl(s2, e2)) => s1 == s2 && e1 == e2,
            (Self::InvalidUrlHost(u1), Self::InvalidUrlHost(u2)) => u1 == u2,
            (Self::UnsupportedScheme(s1), Self::UnsupportedScheme(s2))
            | (Self::MalformedHeader(s1), Self::MalformedHeader(s2))
            | (Self::InvalidMethod(s1), Self::InvalidMethod(s2))
            | (Self::DuplicateKey(s1), Self::DuplicateKey(s2))
            | (Self::Cookies(s1), Self::Cookies(s2)) => s1 == s2,
            (Self::InvalidRateLimit(r1), Self::InvalidRateLimit(r2)) => r1 == r2,
            (Self::EncodeBody(e1), Self::EncodeBody(e2)) => e1.to_string() == e2.to_string(),
            (Self::BuildTransport(e1), Self::BuildTransport(e2)) => {
                e1.to_string() == e2.to_string()
            }
            (Self::Tls(e1), Self::Tls(e2)) => e1 == e2,
            (Self::ParseConfig(e1), Self::ParseConfig(e2)) => e1.message() == e2.message(),
            (Self::InvalidHeader(_), Self::InvalidHeader(_))
            | (Self::InvalidHeaderName(_), Self::InvalidHeaderName(_)) => true,
            _ => false,
        }
    }
}

impl Eq for ErrorKind {}

impl Hash for ErrorKind {
    fn hash<H>(&self, state: &mut H)
    where
        H: std::hash::Hasher,
    {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::IoError(p, e) => (p, e.kind()).hash(state),
            Self::ParseUrl(s, e) => (s, e.to_string()).hash(state),
            Self::InvalidUrlHost(u) => u.hash(state),
            Self::UnsupportedScheme(s)
            | Self::MalformedHeader(s)
            | Self::InvalidMethod(s)
            | Self::DuplicateKey(s)
            | Self::Cookies(s) => s.hash(state),
            Self::InvalidRateLimit(r) => r.hash(state),
            Self::EncodeBody(e) => e.to_string().hash(state),
            Self::BuildTransport(e) => e.to_string().hash(state),
            Self::Tls(e) => e.to_string().hash(state),
            Self::ParseConfig(e) => e.message().hash(state),
            Self::InvalidHeader(e) => e.to_string().hash(state),
            Self::InvalidHeaderName(e) => e.to_string().hash(state),
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<(PathBuf, std::io::Error)> for ErrorKind {
    fn from(value: (PathBuf, std::io::Error)) -> Self {
        Self::IoError(Some(value.0), value.1)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(None, e)
    }
}

impl From<(String, url::ParseError)> for ErrorKind {
    fn from(value: (String, url::ParseError)) -> Self {
        Self::ParseUrl(value.0, value.1)
    }
}

impl From<Infallible> for ErrorKind {
    fn from(_: Infallible) -> Self {
        // tautological
        unreachable!()
    }
}
