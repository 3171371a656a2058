//! The batch client.
//!
//! This module defines two structs, [`BatchClient`] and [`ClientBuilder`].
//! `BatchClient` queues requests and drives them to completion.
//! `ClientBuilder` exposes a finer level of granularity for building
//! a `BatchClient`.
#![allow(clippy::module_name_repetitions, clippy::struct_excessive_bools)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use http::Method;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use typed_builder::TypedBuilder;
use url::Url;

use crate::driver::{Driver, Queued};
use crate::hooks::Hooks;
use crate::pool::PoolStats;
use crate::{
    BatchResults, Completion, CookieJar, DEFAULT_RATE_LIMIT, Destination, DriverFault,
    DriverSettings, ErrorKind, Payload, PreparedRequest, RateLimiter, RequestDescriptor,
    RequestOptions, ReqwestTransport, Result, SharedSession, StatsCollector, TransferError,
    Transport, merge_headers,
};

/// Builder for [`BatchClient`].
///
/// See crate-level documentation for usage example.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
#[builder(builder_method(doc = "
Create a builder for building `ClientBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `ClientBuilder`.
"))]
pub struct ClientBuilder {
    /// Prefix of every relative path passed to the verb helpers.
    ///
    /// Trailing slashes are normalized to exactly one.
    base_url: Option<String>,
    /// Headers sent with every request. Per-call headers of the same name
    /// replace them.
    default_headers: HeaderMap,
    /// Client-wide option overlay, stacked on the hard-coded defaults
    options: RequestOptions,
    /// Tuning of the driver
    driver: DriverSettings,
    /// Maximum number of dispatches per second, at least 1.
    #[builder(default = DEFAULT_RATE_LIMIT)]
    rate_limit: u32,
    /// Share cookies and TLS sessions between connection handles.
    #[builder(default = true)]
    share_session: bool,
    /// Keep response headers in the completions
    collect_headers: bool,
    /// Record a timing breakdown of every request
    collect_stats: bool,
    /// JSON file the shared cookie jar is loaded from and saved to on
    /// [`BatchClient::close`]. Ignored when the session is not shared.
    cookie_jar: Option<PathBuf>,
}

impl Default for ClientBuilder {
    #[must_use]
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientBuilder {
    /// Instantiates a [`BatchClient`] on top of `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if:
    /// - The base URL is not an absolute `http(s)` URL.
    /// - The rate limit is zero.
    /// - The cookie jar file exists but cannot be read.
    /// - The TLS configuration cannot be built.
    pub fn client(self) -> Result<BatchClient> {
        self.client_with(ReqwestTransport::new())
    }

    /// Instantiates a [`BatchClient`] on top of any [`Transport`].
    ///
    /// # Errors
    ///
    /// See [`ClientBuilder::client`].
    pub fn client_with<T: Transport>(self, transport: T) -> Result<BatchClient<T>> {
        let base_url = self.base_url.as_deref().map(normalize_base_url).transpose()?;
        let limiter = RateLimiter::new(self.rate_limit)?;
        let session = if self.share_session {
            let jar = match self.cookie_jar {
                Some(path) => CookieJar::load(path)?,
                None => CookieJar::in_memory(),
            };
            SharedSession::with_cookie_jar(jar)?
        } else {
            SharedSession::disabled()
        };

        Ok(BatchClient {
            driver: Driver::new(transport, session, limiter, self.driver),
            hooks: Hooks::default(),
            results: BatchResults::default(),
            base_url,
            default_headers: self.default_headers,
            options: self.options,
            collect_headers: self.collect_headers,
            collect_stats: self.collect_stats,
        })
    }
}

/// Runs batches of HTTP requests concurrently.
///
/// Requests are identified by a caller supplied key. Results accumulate
/// across batches until [`BatchClient::clear_results`] is called; a key that
/// is submitted again overwrites its earlier result.
///
/// Dropping the client closes every pooled connection. Use
/// [`BatchClient::close`] to also persist a file-backed cookie jar.
///
/// See [`ClientBuilder`] which contains sane defaults for all configuration options.
pub struct BatchClient<T: Transport = ReqwestTransport> {
    driver: Driver<T>,
    hooks: Hooks,
    results: BatchResults,
    base_url: Option<Url>,
    default_headers: HeaderMap,
    options: RequestOptions,
    collect_headers: bool,
    collect_stats: bool,
}

impl<T: Transport> BatchClient<T> {
    /// Queue a `GET` request. The path is the key of the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built or the key is already
    /// pending.
    pub fn get(&mut self, path: &str, headers: HeaderMap) -> Result<&mut Self> {
        self.verb(Method::GET, path, None, headers)
    }

    /// Queue a `POST` request. The path is the key of the request.
    ///
    /// Without per-call headers the body is sent as JSON with a
    /// `Content-Type: application/json` header; a missing body becomes `null`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built, the body cannot be
    /// encoded or the key is already pending.
    pub fn post(
        &mut self,
        path: &str,
        body: Option<Payload>,
        headers: HeaderMap,
    ) -> Result<&mut Self> {
        let (body, headers) = json_by_default(body, headers);
        self.verb(Method::POST, path, body, headers)
    }

    /// Queue a `PUT` request. The body is handled like in [`BatchClient::post`].
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built, the body cannot be
    /// encoded or the key is already pending.
    pub fn put(
        &mut self,
        path: &str,
        body: Option<Payload>,
        headers: HeaderMap,
    ) -> Result<&mut Self> {
        let (body, headers) = json_by_default(body, headers);
        self.verb(Method::PUT, path, body, headers)
    }

    /// Queue a `PATCH` request. No content type is added.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built, the body cannot be
    /// encoded or the key is already pending.
    pub fn patch(
        &mut self,
        path: &str,
        body: Option<Payload>,
        headers: HeaderMap,
    ) -> Result<&mut Self> {
        self.verb(Method::PATCH, path, body, headers)
    }

    /// Queue a `DELETE` request. No content type is added.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built, the body cannot be
    /// encoded or the key is already pending.
    pub fn delete(
        &mut self,
        path: &str,
        body: Option<Payload>,
        headers: HeaderMap,
    ) -> Result<&mut Self> {
        self.verb(Method::DELETE, path, body, headers)
    }

    fn verb(
        &mut self,
        method: Method,
        path: &str,
        body: Option<Payload>,
        headers: HeaderMap,
    ) -> Result<&mut Self> {
        let mut descriptor = RequestDescriptor::new(self.url_for(path)?)
            .with_method(method)
            .with_headers(headers);
        descriptor.body = body;
        self.add_request(path, descriptor)
    }

    /// The URL a verb helper requests for `path`. Absolute `http(s)` URLs
    /// are used as is, anything else is appended to the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ParseUrl`] if no valid URL results.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(path)
            && matches!(url.scheme(), "http" | "https")
        {
            return Ok(url);
        }
        let joined = match &self.base_url {
            Some(base) => format!("{base}{}", path.trim_start_matches('/')),
            None => path.to_string(),
        };
        Url::parse(&joined).map_err(|e| ErrorKind::ParseUrl(joined, e))
    }

    /// Queue a single request under `key`.
    ///
    /// # Errors
    ///
    /// See [`BatchClient::add_requests`].
    pub fn add_request(
        &mut self,
        key: impl Into<String>,
        request: RequestDescriptor,
    ) -> Result<&mut Self> {
        self.add_requests([(key.into(), request)])
    }

    /// Queue a set of requests, keyed by caller supplied keys.
    ///
    /// Client default headers are merged under the per-call headers and the
    /// client-wide options under the per-call overlay. The pre-request hook
    /// then sees the merged overlay of every request and returns the overlay
    /// used for that request alone.
    ///
    /// Queuing is all or nothing: if any request is rejected, none is queued.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DuplicateKey`] if a key is already queued or in
    /// flight, or appears twice in `requests`. Also returns an error if a
    /// URL has no host or a non-`http(s)` scheme, or a body cannot be encoded.
    pub fn add_requests<I, K>(&mut self, requests: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (K, RequestDescriptor)>,
        K: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut validated = Vec::new();
        for (key, descriptor) in requests {
            let key = key.into();
            if self.driver.is_pending(&key) || !seen.insert(key.clone()) {
                return Err(ErrorKind::DuplicateKey(key));
            }
            let destination = Destination::try_from(&descriptor.url)?;
            let body = descriptor.body.clone().map(Payload::into_bytes).transpose()?;
            let headers = merge_headers(&self.default_headers, &descriptor.headers);
            validated.push((key, descriptor, destination, body, headers));
        }

        for (key, descriptor, destination, body, headers) in validated {
            let overlay = self.options.merge(&descriptor.options);
            let overlay = self.hooks.pre_request(&key, &descriptor, overlay);
            log::debug!("Queuing `{key}` ({} {})", descriptor.method, descriptor.url);
            self.results.requeue(&key);
            self.driver.enqueue(Queued {
                key,
                destination,
                request: PreparedRequest {
                    url: descriptor.url,
                    method: descriptor.method,
                    headers,
                    body,
                    options: overlay.resolve(),
                },
                collect_headers: self.collect_headers,
            });
        }
        Ok(self)
    }

    /// Run every queued request to completion.
    ///
    /// Transport errors of single requests are recorded per key and never
    /// end the batch. Results recorded before a fault stay available.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverFault`] if the driver itself failed. The fault is
    /// also appended to [`BatchClient::driver_errors`] and the keys that
    /// were still queued or in flight are listed in
    /// [`BatchClient::unresolved`].
    pub async fn execute(&mut self) -> std::result::Result<(), DriverFault> {
        self.driver
            .run(&mut self.hooks, &mut self.results, self.collect_stats)
            .await
    }

    /// Register the hook called at enqueue time with the merged option
    /// overlay of a request. The returned overlay applies to that request
    /// only.
    pub fn on_pre_request<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&str, &RequestDescriptor, RequestOptions) -> RequestOptions + Send + 'static,
    {
        self.hooks.pre_request = Some(Box::new(hook));
        self
    }

    /// Register the hook called for every drained request, in finish order
    pub fn on_completed<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&str, &Completion) + Send + 'static,
    {
        self.hooks.completed = Some(Box::new(hook));
        self
    }

    /// Register the hook called for every request that failed at the transport
    pub fn on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&str, &TransferError) + Send + 'static,
    {
        self.hooks.error = Some(Box::new(hook));
        self
    }

    /// Register the hook called when a driver pass drained nothing
    pub fn on_idle<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut() + Send + 'static,
    {
        self.hooks.idle = Some(Box::new(hook));
        self
    }

    /// Unregister all hooks
    pub fn clear_hooks(&mut self) -> &mut Self {
        self.hooks = Hooks::default();
        self
    }

    /// Set the prefix of relative request paths.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not an absolute `http(s)` URL.
    pub fn set_base_url(&mut self, url: &str) -> Result<&mut Self> {
        self.base_url = Some(normalize_base_url(url)?);
        Ok(self)
    }

    /// The base URL, always ending in a single slash
    #[must_use]
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_ref().map(Url::as_str)
    }

    /// Replace the default headers
    pub fn set_default_headers(&mut self, headers: HeaderMap) -> &mut Self {
        self.default_headers = headers;
        self
    }

    /// Merge `options` into the client-wide overlay; new values win
    pub fn set_options(&mut self, options: &RequestOptions) -> &mut Self {
        self.options = self.options.merge(options);
        self
    }

    /// The client-wide option overlay
    #[must_use]
    pub const fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Replace the driver tuning
    pub fn set_driver_settings(&mut self, settings: DriverSettings) -> &mut Self {
        self.driver.set_settings(settings);
        self
    }

    /// The driver tuning
    #[must_use]
    pub const fn driver_settings(&self) -> &DriverSettings {
        self.driver.settings()
    }

    /// Set the maximum number of dispatches per second.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidRateLimit`] if `rps` is zero.
    pub fn set_rate_limit(&mut self, rps: u32) -> Result<&mut Self> {
        self.driver.limiter_mut().set_rps(rps)?;
        Ok(self)
    }

    /// Keep response headers in the completions of requests queued from now on
    pub const fn collect_response_headers(&mut self, collect: bool) -> &mut Self {
        self.collect_headers = collect;
        self
    }

    /// Record a timing breakdown of every request drained from now on
    pub const fn enable_stats(&mut self, enable: bool) -> &mut Self {
        self.collect_stats = enable;
        self
    }

    /// Stop sharing cookies and TLS sessions for connections opened from now
    /// on. Pooled connections keep their binding. There is no way back.
    ///
    /// # Errors
    ///
    /// Returns an error if a file-backed cookie jar cannot be saved.
    pub fn disable_sharing(&mut self) -> Result<&mut Self> {
        self.driver.session_mut().disable()?;
        Ok(self)
    }

    /// The shared cookie jar, while sharing is enabled
    #[must_use]
    pub fn cookie_jar(&self) -> Option<&CookieJar> {
        self.driver.session().cookie_jar()
    }

    /// Completion of `key`, failed transfers included
    #[must_use]
    pub fn result(&self, key: &str) -> Option<&Completion> {
        self.results.get(key)
    }

    /// Transfer error of `key`
    #[must_use]
    pub fn error(&self, key: &str) -> Option<&TransferError> {
        self.results.error(key)
    }

    /// All completions by key
    #[must_use]
    pub const fn completed(&self) -> &HashMap<String, Completion> {
        self.results.completed()
    }

    /// Completions that received a response
    pub fn succeeded(&self) -> impl Iterator<Item = (&String, &Completion)> {
        self.results.succeeded()
    }

    /// All transfer errors by key
    #[must_use]
    pub const fn errors(&self) -> &HashMap<String, TransferError> {
        self.results.errors()
    }

    /// Faults of the driver, across all batches
    #[must_use]
    pub fn driver_errors(&self) -> &[DriverFault] {
        self.results.driver_errors()
    }

    /// Keys left queued or in flight by any driver fault so far, until they
    /// are submitted again or the results are cleared
    #[must_use]
    pub fn unresolved(&self) -> &[String] {
        self.results.unresolved()
    }

    /// Timing breakdowns by key
    #[must_use]
    pub const fn stats(&self) -> &StatsCollector {
        self.results.stats()
    }

    /// Everything recorded so far
    #[must_use]
    pub const fn results(&self) -> &BatchResults {
        &self.results
    }

    /// Forget every recorded result
    pub fn clear_results(&mut self) -> &mut Self {
        self.results.clear();
        self
    }

    /// The effective request queued under `key`
    #[must_use]
    pub fn pending(&self, key: &str) -> Option<&PreparedRequest> {
        self.driver.pending(key)
    }

    /// Counters of the connection pool
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.driver.pool_stats()
    }

    /// The underlying transport
    #[must_use]
    pub fn transport(&self) -> &T {
        self.driver.transport()
    }

    /// Drop queued requests, close every pooled connection and persist a
    /// file-backed cookie jar.
    ///
    /// # Errors
    ///
    /// Returns an error if the cookie jar cannot be saved.
    pub fn close(mut self) -> Result<()> {
        self.driver.shutdown();
        self.driver.session().save()
    }
}

impl<T: Transport> std::fmt::Debug for BatchClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchClient")
            .field("driver", &self.driver)
            .field("hooks", &self.hooks)
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("default_headers", &self.default_headers)
            .field("options", &self.options)
            .field("collect_headers", &self.collect_headers)
            .field("collect_stats", &self.collect_stats)
            .finish_non_exhaustive()
    }
}

/// Without per-call headers, send the body as JSON
fn json_by_default(body: Option<Payload>, mut headers: HeaderMap) -> (Option<Payload>, HeaderMap) {
    if !headers.is_empty() {
        return (body, headers);
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    (Some(body.unwrap_or(Payload::Json(Value::Null))), headers)
}

fn normalize_base_url(url: &str) -> Result<Url> {
    let normalized = format!("{}/", url.trim_end_matches('/'));
    let parsed =
        Url::parse(&normalized).map_err(|e| ErrorKind::ParseUrl(url.to_string(), e))?;
    Destination::try_from(&parsed)?;
    Ok(parsed)
}
