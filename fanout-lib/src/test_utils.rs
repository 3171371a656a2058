//! A scripted transport for driving the client without a network.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::time::Instant;
use url::Url;

use crate::{
    Destination, Exchange, PreparedRequest, Result, SessionBinding, Timings, TransferError,
    TransferErrorKind, Transport,
};

/// Scripted behavior of one URL
#[derive(Debug, Clone)]
pub(crate) struct Script {
    status: StatusCode,
    delay: Duration,
    redirect_to: Option<Url>,
    fail: Option<TransferErrorKind>,
    panics: bool,
}

impl Script {
    pub(crate) const fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            delay: Duration::ZERO,
            redirect_to: None,
            fail: None,
            panics: false,
        }
    }

    pub(crate) const fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub(crate) const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// End the transfer at `url`, as if the server redirected there
    pub(crate) fn redirect_to(mut self, url: &str) -> Self {
        self.redirect_to = Some(Url::parse(url).unwrap());
        self
    }

    pub(crate) const fn fail(mut self, kind: TransferErrorKind) -> Self {
        self.fail = Some(kind);
        self
    }

    pub(crate) const fn panics(mut self) -> Self {
        self.panics = true;
        self
    }
}

/// Handle of the stub transport
#[derive(Debug)]
pub(crate) struct StubHandle {
    pub(crate) id: usize,
    pub(crate) shared: bool,
}

/// A dispatch observed by the stub
#[derive(Debug, Clone)]
pub(crate) struct Dispatched {
    pub(crate) url: Url,
    pub(crate) handle: usize,
    pub(crate) at: Instant,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Bytes>,
    pub(crate) timeout: Duration,
}

/// Transport answering from scripts. URLs without a script answer `200 OK`
/// immediately.
#[derive(Debug, Default)]
pub(crate) struct StubTransport {
    scripts: HashMap<String, Script>,
    opened: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    dispatched: Mutex<Vec<Dispatched>>,
}

impl StubTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn route(mut self, url: &str, script: Script) -> Self {
        let url = Url::parse(url).unwrap();
        self.scripts.insert(url.to_string(), script);
        self
    }

    /// Number of handles opened
    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Highest number of transfers running at once
    pub(crate) fn max_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every dispatch in dispatch order
    pub(crate) fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for StubTransport {
    type Handle = StubHandle;

    fn open(
        &self,
        _destination: &Destination,
        session: Option<&SessionBinding>,
    ) -> Result<Self::Handle> {
        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(StubHandle {
            id,
            shared: session.is_some(),
        })
    }

    async fn perform(
        &self,
        handle: &mut Self::Handle,
        request: PreparedRequest,
    ) -> std::result::Result<Exchange, TransferError> {
        let script = self
            .scripts
            .get(request.url.as_str())
            .cloned()
            .unwrap_or_else(Script::ok);
        self.dispatched.lock().unwrap().push(Dispatched {
            url: request.url.clone(),
            handle: handle.id,
            at: Instant::now(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timeout: request.options.timeout,
        });

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let started = Instant::now();
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        assert!(!script.panics, "scripted panic for {}", request.url);
        if let Some(kind) = script.fail {
            return Err(TransferError::new(
                kind,
                format!("scripted {kind} failure for {}", request.url),
            ));
        }

        let total = started.elapsed();
        let mut headers = HeaderMap::new();
        headers.insert("x-handle", HeaderValue::from(handle.id));
        headers.insert(
            "x-shared",
            HeaderValue::from_static(if handle.shared { "yes" } else { "no" }),
        );
        Ok(Exchange {
            status: script.status,
            headers,
            body: if request.options.buffer_body {
                Bytes::from(request.url.to_string())
            } else {
                Bytes::new()
            },
            effective_url: script.redirect_to.unwrap_or(request.url),
            timings: Timings {
                namelookup: total / 10,
                connect: total / 5,
                pretransfer: total / 4,
                starttransfer: total / 2,
                redirect: Duration::ZERO,
                total,
            },
        })
    }
}
