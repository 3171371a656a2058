//! Session state shared by connection handles: the cookie jar and the TLS
//! session cache.
//!
//! A handle binds to the session once, when it is opened, and keeps that
//! binding for its whole life. Disabling sharing therefore only affects
//! handles opened afterwards.

use std::sync::Arc;

use crate::{CookieJar, Result};

/// Protocols offered via ALPN, most preferred first
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// What a connection handle binds to when it shares the session.
///
/// Cloning a binding is cheap and every clone refers to the same state.
#[derive(Debug, Clone)]
pub struct SessionBinding {
    cookies: CookieJar,
    tls: Arc<rustls::ClientConfig>,
}

impl SessionBinding {
    /// The shared cookie jar
    #[must_use]
    pub const fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// The shared TLS configuration.
    ///
    /// Clones of a [`rustls::ClientConfig`] share its session cache, so every
    /// handle built from it can resume sessions established by any other.
    #[must_use]
    pub fn tls(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.tls)
    }

    /// Whether both bindings refer to the same session
    #[must_use]
    pub fn same_session(&self, other: &SessionBinding) -> bool {
        Arc::ptr_eq(&self.tls, &other.tls) && self.cookies == other.cookies
    }
}

/// The session shared by all handles of one client
#[derive(Debug)]
pub struct SharedSession {
    state: Option<SessionBinding>,
}

impl SharedSession {
    /// Create a session with an in-memory cookie jar
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_cookie_jar(CookieJar::in_memory())
    }

    /// Create a session around an existing cookie jar
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration cannot be built.
    pub fn with_cookie_jar(cookies: CookieJar) -> Result<Self> {
        Ok(Self {
            state: Some(SessionBinding {
                cookies,
                tls: Arc::new(tls_config()?),
            }),
        })
    }

    /// A session that shares nothing; handles get private state
    #[must_use]
    pub const fn disabled() -> Self {
        Self { state: None }
    }

    /// The binding for a new handle, `None` once sharing is disabled
    #[must_use]
    pub fn bind(&self) -> Option<&SessionBinding> {
        self.state.as_ref()
    }

    /// Whether new handles still share the session
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    /// The shared cookie jar, if sharing is enabled
    #[must_use]
    pub fn cookie_jar(&self) -> Option<&CookieJar> {
        self.state.as_ref().map(SessionBinding::cookies)
    }

    /// Stop sharing for good and release the client's reference to the
    /// session. A file-backed cookie jar is saved first.
    /// Handles bound before keep their binding.
    ///
    /// # Errors
    ///
    /// Returns an error if the cookie jar cannot be saved.
    pub fn disable(&mut self) -> Result<()> {
        if let Some(binding) = self.state.take() {
            log::debug!("Session sharing disabled");
            binding.cookies.save()?;
        }
        Ok(())
    }

    /// Persist the cookie jar, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the cookie jar cannot be saved.
    pub fn save(&self) -> Result<()> {
        match &self.state {
            Some(binding) => binding.cookies.save(),
            None => Ok(()),
        }
    }
}

/// TLS configuration with the webpki root store and the `ring` provider
fn tls_config() -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}
