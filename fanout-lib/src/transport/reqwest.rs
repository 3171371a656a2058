//! [`Transport`] implementation on top of `reqwest`.
//!
//! Every connection handle owns its own `reqwest::Client`, and with it a
//! private keep-alive connection cache. Reusing a handle therefore reuses the
//! underlying TCP/TLS connection when the server keeps it open.
//!
//! Name lookup and connection setup are timed from inside reqwest: a custom
//! resolver marks the end of the lookup and a connector layer marks the moment
//! a new connection is ready, TLS handshake included. A transfer that runs on
//! a kept-alive connection has neither mark.

use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::Policy;
use tower::{Layer, Service};

use super::classify::{ResolveError, classify};
use super::{Exchange, PreparedRequest, TransferError, TransferErrorKind, Transport};
use crate::{Destination, ErrorKind, Result, SessionBinding, Timings, TransferOptions};

/// Keep-alive probe interval of handle connections
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// The production transport, backed by `reqwest`
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestTransport;

impl ReqwestTransport {
    /// Create the transport
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Options baked into a `reqwest::Client`. Changing any of them rebuilds the
/// client of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientKey {
    connect_timeout: Duration,
    auto_referer: bool,
    accept_encoding: bool,
    user_agent: String,
}

impl From<&TransferOptions> for ClientKey {
    fn from(options: &TransferOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
            auto_referer: options.auto_referer,
            accept_encoding: options.accept_encoding,
            user_agent: options.user_agent.clone(),
        }
    }
}

/// Per-transfer state observed from inside reqwest
#[derive(Debug)]
struct ProbeState {
    started: Instant,
    namelookup: Option<Duration>,
    connect: Option<Duration>,
    redirect: Option<Duration>,
    follow_redirects: bool,
    max_redirects: usize,
}

/// Shared between a handle, its DNS resolver and its redirect policy.
/// A handle performs one transfer at a time, so the state belongs to the
/// transfer currently running on it.
#[derive(Debug)]
struct Probe(Mutex<ProbeState>);

impl Probe {
    fn new() -> Self {
        Self(Mutex::new(ProbeState {
            started: Instant::now(),
            namelookup: None,
            connect: None,
            redirect: None,
            follow_redirects: true,
            max_redirects: 0,
        }))
    }

    fn state(&self) -> MutexGuard<'_, ProbeState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, options: &TransferOptions) -> Instant {
        let mut state = self.state();
        state.started = Instant::now();
        state.namelookup = None;
        state.connect = None;
        state.redirect = None;
        state.follow_redirects = options.follow_redirects;
        state.max_redirects = options.max_redirects;
        state.started
    }

    fn record_lookup(&self) {
        let mut state = self.state();
        // only the first lookup of a transfer counts
        if state.namelookup.is_none() {
            state.namelookup = Some(state.started.elapsed());
        }
    }

    fn record_connect(&self) {
        let mut state = self.state();
        if state.connect.is_none() {
            state.connect = Some(state.started.elapsed());
        }
    }

    fn record_redirect(&self) {
        let mut state = self.state();
        state.redirect = Some(state.started.elapsed());
    }

    /// Name lookup, connect and redirect marks of the finished transfer
    fn finish(&self) -> (Duration, Duration, Duration) {
        let state = self.state();
        let namelookup = state.namelookup.unwrap_or_default();
        (
            namelookup,
            state.connect.unwrap_or(namelookup),
            state.redirect.unwrap_or_default(),
        )
    }
}

/// DNS resolver that records when name resolution finished
#[derive(Debug)]
struct TimingResolver {
    probe: Arc<Probe>,
}

impl Resolve for TimingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let probe = Arc::clone(&self.probe);
        Box::pin(async move {
            let addrs: Vec<_> = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|e| Box::new(ResolveError(e)) as Box<dyn Error + Send + Sync>)?
                .collect();
            probe.record_lookup();
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}

/// Connector layer that records when a new connection is ready
#[derive(Debug, Clone)]
struct TimingLayer {
    probe: Arc<Probe>,
}

impl<S> Layer<S> for TimingLayer {
    type Service = TimingConnector<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimingConnector {
            inner,
            probe: Arc::clone(&self.probe),
        }
    }
}

#[derive(Debug, Clone)]
struct TimingConnector<S> {
    inner: S,
    probe: Arc<Probe>,
}

impl<S, R> Service<R> for TimingConnector<S>
where
    S: Service<R> + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    S::Error: 'static,
    R: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, destination: R) -> Self::Future {
        let probe = Arc::clone(&self.probe);
        let connecting = self.inner.call(destination);
        Box::pin(async move {
            let connection = connecting.await?;
            probe.record_connect();
            Ok(connection)
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Too many redirects")]
struct TooManyRedirects;

/// A pooled connection handle of [`ReqwestTransport`]
#[derive(Debug)]
pub struct ReqwestHandle {
    destination: Destination,
    session: Option<SessionBinding>,
    probe: Arc<Probe>,
    client: Option<(ClientKey, reqwest::Client)>,
    builds: usize,
}

impl ReqwestHandle {
    /// Destination the handle was opened for
    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Whether the handle shares the client's session
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.session.is_some()
    }

    /// How often the underlying client was (re)built
    #[must_use]
    pub const fn builds(&self) -> usize {
        self.builds
    }

    /// The client for `options`, rebuilt if its baked-in options changed
    fn client_for(&mut self, options: &TransferOptions) -> Result<reqwest::Client> {
        let key = ClientKey::from(options);
        if let Some((current, client)) = &self.client
            && *current == key
        {
            return Ok(client.clone());
        }

        log::trace!(
            "Building HTTP client for connection to {} ({:?})",
            self.destination,
            key
        );
        let client = self.build_client(&key)?;
        self.client = Some((key, client.clone()));
        self.builds += 1;
        Ok(client)
    }

    fn build_client(&self, key: &ClientKey) -> Result<reqwest::Client> {
        let probe = Arc::clone(&self.probe);
        let redirect_policy = Policy::custom(move |attempt| {
            let (follow, max_redirects) = {
                let state = probe.state();
                (state.follow_redirects, state.max_redirects)
            };
            if !follow {
                attempt.stop()
            } else if attempt.previous().len() > max_redirects {
                attempt.error(TooManyRedirects)
            } else {
                probe.record_redirect();
                log::debug!("Following redirect to {}", attempt.url());
                attempt.follow()
            }
        });

        let builder = reqwest::ClientBuilder::new()
            .connect_timeout(key.connect_timeout)
            .referer(key.auto_referer)
            .gzip(key.accept_encoding)
            .user_agent(key.user_agent.clone())
            .tcp_keepalive(TCP_KEEPALIVE)
            .dns_resolver(Arc::new(TimingResolver {
                probe: Arc::clone(&self.probe),
            }))
            .connector_layer(TimingLayer {
                probe: Arc::clone(&self.probe),
            })
            .redirect(redirect_policy);

        let builder = match &self.session {
            Some(binding) => builder
                .cookie_provider(binding.cookies().store())
                .use_preconfigured_tls((*binding.tls()).clone()),
            None => builder.cookie_store(true),
        };

        builder.build().map_err(ErrorKind::BuildTransport)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    type Handle = ReqwestHandle;

    fn open(
        &self,
        destination: &Destination,
        session: Option<&SessionBinding>,
    ) -> Result<Self::Handle> {
        Ok(ReqwestHandle {
            destination: destination.clone(),
            session: session.cloned(),
            probe: Arc::new(Probe::new()),
            client: None,
            builds: 0,
        })
    }

    async fn perform(
        &self,
        handle: &mut Self::Handle,
        request: PreparedRequest,
    ) -> std::result::Result<Exchange, TransferError> {
        let PreparedRequest {
            url,
            method,
            headers,
            body,
            options,
        } = request;

        let client = handle
            .client_for(&options)
            .map_err(|e| TransferError::new(TransferErrorKind::Request, e.to_string()))?;

        let started = handle.probe.start(&options);
        let mut builder = client
            .request(method, url)
            .headers(headers)
            .timeout(options.timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;
        let starttransfer = started.elapsed();

        let status = response.status();
        let headers = response.headers().clone();
        let effective_url = response.url().clone();
        let body = response.bytes().await.map_err(|e| classify(&e))?;
        let total = started.elapsed();

        // the connect mark already covers the TLS handshake
        let (namelookup, connect, redirect) = handle.probe.finish();
        let timings = Timings {
            namelookup,
            connect,
            pretransfer: connect,
            starttransfer,
            redirect,
            total,
        }
        .normalized();

        Ok(Exchange {
            status,
            headers,
            body: if options.buffer_body { body } else { Bytes::new() },
            effective_url,
            timings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RequestOptions, SharedSession};
    use http::{HeaderMap, Method, StatusCode};
    use url::Url;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prepared(url: &str, options: RequestOptions) -> PreparedRequest {
        PreparedRequest {
            url: Url::parse(url).unwrap(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            options: options.resolve(),
        }
    }

    fn open(url: &str, session: Option<&SessionBinding>) -> ReqwestHandle {
        let destination = Destination::try_from(&Url::parse(url).unwrap()).unwrap();
        ReqwestTransport.open(&destination, session).unwrap()
    }

    #[tokio::test]
    async fn test_simple_exchange() {
        let mock_server = test_utils::mock_server!(StatusCode::OK, set_body_string("hello"));
        let url = format!("{}/", mock_server.uri());
        let mut handle = open(&url, None);

        let exchange = ReqwestTransport
            .perform(&mut handle, prepared(&url, RequestOptions::default()))
            .await
            .unwrap();

        assert_eq!(exchange.status, StatusCode::OK);
        assert_eq!(exchange.body, Bytes::from("hello"));
        assert_eq!(exchange.effective_url.as_str(), url);
        assert!(exchange.timings.starttransfer <= exchange.timings.total);
        assert!(!handle.is_shared());
    }

    #[tokio::test]
    async fn test_connect_timing_on_fresh_and_reused_connections() {
        let mock_server = test_utils::mock_server!(StatusCode::OK);
        let url = mock_server.uri();
        let mut handle = open(&url, None);

        let fresh = ReqwestTransport
            .perform(&mut handle, prepared(&url, RequestOptions::default()))
            .await
            .unwrap()
            .timings;
        assert!(fresh.connect > fresh.namelookup);
        assert!(fresh.pretransfer >= fresh.connect);
        assert!(fresh.starttransfer >= fresh.pretransfer);

        // give the connection time to return to the keep-alive pool
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reused = ReqwestTransport
            .perform(&mut handle, prepared(&url, RequestOptions::default()))
            .await
            .unwrap()
            .timings;
        assert_eq!(reused.namelookup, Duration::ZERO);
        assert_eq!(reused.connect, Duration::ZERO);
        assert_eq!(reused.pretransfer, Duration::ZERO);
        assert!(reused.total > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_body_not_buffered() {
        let mock_server = test_utils::mock_server!(StatusCode::OK, set_body_string("hello"));
        let url = mock_server.uri();
        let mut handle = open(&url, None);
        let options = RequestOptions {
            buffer_body: Some(false),
            ..RequestOptions::default()
        };

        let exchange = ReqwestTransport
            .perform(&mut handle, prepared(&url, options))
            .await
            .unwrap();
        assert!(exchange.body.is_empty());
    }

    #[tokio::test]
    async fn test_client_rebuilt_only_on_option_change() {
        let mock_server = test_utils::mock_server!(StatusCode::OK);
        let url = mock_server.uri();
        let mut handle = open(&url, None);

        for _ in 0..2 {
            ReqwestTransport
                .perform(&mut handle, prepared(&url, RequestOptions::default()))
                .await
                .unwrap();
        }
        assert_eq!(handle.builds(), 1);

        let options = RequestOptions {
            user_agent: Some("other".into()),
            ..RequestOptions::default()
        };
        ReqwestTransport
            .perform(&mut handle, prepared(&url, options))
            .await
            .unwrap();
        assert_eq!(handle.builds(), 2);
    }

    #[tokio::test]
    async fn test_follows_redirect() {
        test_utils::redirecting_mock_server!(|redirect_url: Url, ok_url: Url| async move {
            let mut handle = open(redirect_url.as_str(), None);
            let exchange = ReqwestTransport
                .perform(
                    &mut handle,
                    prepared(redirect_url.as_str(), RequestOptions::default()),
                )
                .await
                .unwrap();
            assert_eq!(exchange.status, StatusCode::OK);
            assert_eq!(exchange.effective_url, ok_url);
            assert!(exchange.timings.redirect <= exchange.timings.total);
        })
        .await;
    }

    #[tokio::test]
    async fn test_redirects_not_followed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(
                ResponseTemplate::new(StatusCode::FOUND).insert_header("Location", "/elsewhere"),
            )
            .mount(&mock_server)
            .await;
        let url = format!("{}/moved", mock_server.uri());
        let mut handle = open(&url, None);
        let options = RequestOptions {
            follow_redirects: Some(false),
            ..RequestOptions::default()
        };

        let exchange = ReqwestTransport
            .perform(&mut handle, prepared(&url, options))
            .await
            .unwrap();
        assert_eq!(exchange.status, StatusCode::FOUND);
        assert_eq!(exchange.effective_url.as_str(), url);
    }

    #[tokio::test]
    async fn test_too_many_redirects() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(
                ResponseTemplate::new(StatusCode::FOUND).insert_header("Location", "/loop"),
            )
            .mount(&mock_server)
            .await;
        let url = format!("{}/loop", mock_server.uri());
        let mut handle = open(&url, None);
        let options = RequestOptions {
            max_redirects: Some(2),
            ..RequestOptions::default()
        };

        let error = ReqwestTransport
            .perform(&mut handle, prepared(&url, options))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), TransferErrorKind::TooManyRedirects);
    }

    #[tokio::test]
    async fn test_timeout() {
        let mock_server = test_utils::mock_server!(
            StatusCode::OK,
            set_delay(Duration::from_millis(500))
        );
        let url = mock_server.uri();
        let mut handle = open(&url, None);
        let options = RequestOptions {
            timeout: Some(Duration::from_millis(50)),
            ..RequestOptions::default()
        };

        let error = ReqwestTransport
            .perform(&mut handle, prepared(&url, options))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), TransferErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_shared_session_cookies() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(StatusCode::OK)
                    .insert_header("Set-Cookie", "session=abc; Path=/"),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/profile"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(StatusCode::OK))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/profile"))
            .respond_with(ResponseTemplate::new(StatusCode::UNAUTHORIZED))
            .mount(&mock_server)
            .await;

        let session = SharedSession::new().unwrap();
        let binding = session.bind().unwrap();
        let login = format!("{}/login", mock_server.uri());
        let profile = format!("{}/profile", mock_server.uri());

        let mut first = open(&login, Some(binding));
        let mut second = open(&profile, Some(binding));
        let mut unbound = open(&profile, None);
        assert!(first.is_shared());

        ReqwestTransport
            .perform(&mut first, prepared(&login, RequestOptions::default()))
            .await
            .unwrap();
        let shared = ReqwestTransport
            .perform(&mut second, prepared(&profile, RequestOptions::default()))
            .await
            .unwrap();
        let private = ReqwestTransport
            .perform(&mut unbound, prepared(&profile, RequestOptions::default()))
            .await
            .unwrap();

        assert_eq!(shared.status, StatusCode::OK);
        assert_eq!(private.status, StatusCode::UNAUTHORIZED);
        assert_eq!(binding.cookies().len(), 1);
    }
}
