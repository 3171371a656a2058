//! The transport primitive the driver multiplexes over.
//!
//! A [`Transport`] opens opaque connection handles and performs one request
//! at a time on a handle. The driver owns the handles, pools them per
//! [`Destination`] and never looks inside.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::{Destination, Result, SessionBinding, Timings, TransferOptions};

mod classify;
mod reqwest;

pub use self::reqwest::ReqwestTransport;

/// A request with every layer of defaults applied, ready to be performed
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    /// Absolute target URL
    pub url: Url,
    /// Request method
    pub method: Method,
    /// Effective headers (defaults merged under per-call headers)
    pub headers: HeaderMap,
    /// Encoded body
    pub body: Option<Bytes>,
    /// Resolved transfer options
    pub options: TransferOptions,
}

/// Outcome of a transfer that produced a response
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Status of the final response
    pub status: StatusCode,
    /// Headers of the final response
    pub headers: HeaderMap,
    /// Response body; empty when body buffering is off
    pub body: Bytes,
    /// URL of the final response, after redirects
    pub effective_url: Url,
    /// Timing marks of the transfer
    pub timings: Timings,
}

/// Category of a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferErrorKind {
    /// Connect or transfer timeout elapsed
    Timeout,
    /// Host name could not be resolved
    Dns,
    /// Connection could not be established or broke
    Connect,
    /// TLS handshake or certificate failure
    Tls,
    /// Redirect cap exceeded
    TooManyRedirects,
    /// Response body could not be read or decoded
    Body,
    /// Request could not be built or sent
    Request,
    /// Anything else
    Other,
}

/// A per-request transport failure.
///
/// These never abort a batch; they are reported per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error, Serialize)]
#[error("{message} ({kind})")]
pub struct TransferError {
    kind: TransferErrorKind,
    message: String,
}

impl TransferError {
    /// Create a transfer error. An empty message is replaced by the kind.
    #[must_use]
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = format!("Transfer failed: {kind}");
        }
        Self { kind, message }
    }

    /// Category of the failure
    #[must_use]
    pub const fn kind(&self) -> TransferErrorKind {
        self.kind
    }

    /// Human readable description, never empty
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An HTTP transport with reusable connection handles.
///
/// Implementations must be usable from many concurrently running transfers;
/// each transfer gets exclusive access to its handle.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opaque connection handle
    type Handle: Send + 'static;

    /// Open a new handle for `destination`.
    /// With a session the handle shares its cookies and TLS sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be constructed.
    fn open(
        &self,
        destination: &Destination,
        session: Option<&SessionBinding>,
    ) -> Result<Self::Handle>;

    /// Perform a single request on `handle`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] if no response could be obtained.
    async fn perform(
        &self,
        handle: &mut Self::Handle,
        request: PreparedRequest,
    ) -> std::result::Result<Exchange, TransferError>;
}
