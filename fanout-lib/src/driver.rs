//! The multiplexed driver.
//!
//! One loop advances every in-flight transfer of a batch. Each pass it
//!
//! 1. dispatches queued requests while the concurrency caps, the connection
//!    pool and the rate limiter allow it,
//! 2. drains every transfer that finished, in finish order,
//! 3. calls the idle hook and waits (bounded) for activity if nothing finished.
//!
//! A panic inside a transfer or a completion that cannot be correlated is a
//! [`DriverFault`]: it ends the batch and leaves the remaining keys
//! unresolved. Transport errors of single requests never end a batch.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::options::limit;
use crate::pool::{Connection, ConnectionPool, PoolStats};
use crate::registry::{InFlight, RequestRegistry, SlotId};
use crate::{
    BatchResults, Completion, Destination, DriverSettings, Exchange, Hooks, PreparedRequest,
    RateLimiter, SharedSession, Timings, TransferError, TransferErrorKind, Transport,
};

/// A fault of the driver itself, fatal to the running batch
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum DriverFault {
    /// The transport reported a completion for a slot nobody registered
    #[error("Completion reported for unknown {0}")]
    UnknownHandle(SlotId),
    /// A key was dispatched while an earlier instance was still in flight
    #[error("Request key `{0}` dispatched while already in flight")]
    DuplicateInFlight(String),
    /// A transfer panicked inside the multiplexer
    #[error("Transfer panicked: {0}")]
    Panicked(String),
}

/// Lifecycle of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum DriverState {
    /// No batch is running
    Idle,
    /// Dispatching and draining
    Running,
    /// The queue is empty; waiting for in-flight requests
    Draining,
}

/// A request waiting for dispatch
#[derive(Debug, Clone)]
pub(crate) struct Queued {
    pub(crate) key: String,
    pub(crate) destination: Destination,
    pub(crate) request: PreparedRequest,
    pub(crate) collect_headers: bool,
}

type Transfer<H> = (
    SlotId,
    Connection<H>,
    std::result::Result<Exchange, TransferError>,
);
type TransferFuture<H> = BoxFuture<'static, std::thread::Result<Transfer<H>>>;
type InFlightSet<H> = FuturesUnordered<TransferFuture<H>>;

/// Result of a dispatch attempt
enum Dispatch {
    /// Nothing left to dispatch, or blocked by a cap until a transfer finishes
    Blocked,
    /// Blocked by the rate limiter for the given time
    Throttled(Duration),
}

/// Drives batches of requests over a [`Transport`]
pub struct Driver<T: Transport> {
    transport: Arc<T>,
    pool: ConnectionPool<T::Handle>,
    session: SharedSession,
    registry: RequestRegistry,
    limiter: RateLimiter,
    settings: DriverSettings,
    /// Waiting requests per destination, tagged with their submission order
    queues: HashMap<Destination, VecDeque<(u64, Queued)>>,
    queued_keys: HashMap<String, Destination>,
    next_seq: u64,
    state: DriverState,
}

impl<T: Transport> Driver<T> {
    pub(crate) fn new(
        transport: T,
        session: SharedSession,
        limiter: RateLimiter,
        settings: DriverSettings,
    ) -> Self {
        let pool = ConnectionPool::new()
            .with_max_idle(settings.max_idle_connections)
            .with_max_busy(limit(settings.max_total_connections));
        Self {
            transport: Arc::new(transport),
            pool,
            session,
            registry: RequestRegistry::new(),
            limiter,
            settings,
            queues: HashMap::new(),
            queued_keys: HashMap::new(),
            next_seq: 0,
            state: DriverState::Idle,
        }
    }

    /// Current lifecycle state
    pub(crate) const fn state(&self) -> DriverState {
        self.state
    }

    /// Number of requests waiting for dispatch
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued_keys.len()
    }

    /// Number of requests in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Counters of the connection pool
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) const fn session(&self) -> &SharedSession {
        &self.session
    }

    pub(crate) const fn session_mut(&mut self) -> &mut SharedSession {
        &mut self.session
    }

    pub(crate) const fn limiter_mut(&mut self) -> &mut RateLimiter {
        &mut self.limiter
    }

    pub(crate) const fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub(crate) fn set_settings(&mut self, settings: DriverSettings) {
        self.pool.set_limits(
            settings.max_idle_connections,
            limit(settings.max_total_connections),
        );
        self.settings = settings;
    }

    /// Whether `key` is queued or in flight
    pub(crate) fn is_pending(&self, key: &str) -> bool {
        self.queued_keys.contains_key(key) || self.registry.contains_key(key)
    }

    /// The queued request of `key`
    pub(crate) fn pending(&self, key: &str) -> Option<&PreparedRequest> {
        let destination = self.queued_keys.get(key)?;
        self.queues
            .get(destination)?
            .iter()
            .find(|(_, queued)| queued.key == key)
            .map(|(_, queued)| &queued.request)
    }

    pub(crate) fn enqueue(&mut self, queued: Queued) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued_keys
            .insert(queued.key.clone(), queued.destination.clone());
        self.queues
            .entry(queued.destination.clone())
            .or_default()
            .push_back((seq, queued));
    }

    /// Destination of the oldest queued request whose destination is below
    /// the per-host cap
    fn next_destination(&self, max_host: Option<usize>) -> Option<Destination> {
        self.queues
            .iter()
            .filter(|(destination, _)| max_host.is_none_or(|max| self.pool.busy(destination) < max))
            .filter_map(|(destination, queue)| queue.front().map(|(seq, _)| (*seq, destination)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, destination)| destination.clone())
    }

    /// Take the oldest queued request of `destination`
    fn dequeue(&mut self, destination: &Destination) -> Option<Queued> {
        let queue = self.queues.get_mut(destination)?;
        let (_, queued) = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(destination);
        }
        self.queued_keys.remove(&queued.key);
        Some(queued)
    }

    /// Empty the queue, returning its keys in submission order
    fn drain_queue(&mut self) -> Vec<String> {
        let mut waiting: Vec<_> = self.queues.drain().flat_map(|(_, queue)| queue).collect();
        waiting.sort_by_key(|(seq, _)| *seq);
        self.queued_keys.clear();
        waiting.into_iter().map(|(_, queued)| queued.key).collect()
    }

    /// Run until the queue is empty and nothing is in flight, or a fault
    /// ends the batch.
    pub(crate) async fn run(
        &mut self,
        hooks: &mut Hooks,
        results: &mut BatchResults,
        collect_stats: bool,
    ) -> Result<(), DriverFault> {
        let mut in_flight: InFlightSet<T::Handle> = FuturesUnordered::new();
        self.state = DriverState::Running;
        log::debug!("Starting batch of {} request(s)", self.queued());

        let outcome = self
            .drive(&mut in_flight, hooks, results, collect_stats)
            .await;
        if let Err(fault) = &outcome {
            log::warn!("Driver fault, aborting batch: {fault}");
            // dropping the set cancels every transfer; their handles are lost
            drop(in_flight);
            self.pool.reset_busy();
            let mut unresolved = self.registry.drain();
            unresolved.extend(self.drain_queue());
            results.unresolved.extend(unresolved);
            results.driver_errors.push(fault.clone());
        }

        self.state = DriverState::Idle;
        outcome
    }

    async fn drive(
        &mut self,
        in_flight: &mut InFlightSet<T::Handle>,
        hooks: &mut Hooks,
        results: &mut BatchResults,
        collect_stats: bool,
    ) -> Result<(), DriverFault> {
        loop {
            let dispatch = self.dispatch(in_flight, hooks, results)?;
            if self.queued_keys.is_empty() && self.state == DriverState::Running {
                self.state = DriverState::Draining;
                log::debug!("Driver {}, {} request(s) in flight", self.state, in_flight.len());
            }

            if in_flight.is_empty() {
                if self.queued_keys.is_empty() {
                    return Ok(());
                }
                // only the rate limiter can hold back a request when nothing
                // is in flight
                match dispatch {
                    Dispatch::Throttled(wait) => tokio::time::sleep(wait).await,
                    Dispatch::Blocked => tokio::task::yield_now().await,
                }
                continue;
            }

            let mut drained = 0;
            while let Some(Some(outcome)) = in_flight.next().now_or_never() {
                self.finish(outcome, hooks, results, collect_stats)?;
                drained += 1;
            }
            if drained > 0 {
                continue;
            }

            hooks.idle();
            let wait = match dispatch {
                Dispatch::Throttled(throttle) => throttle.min(self.settings.select_timeout),
                Dispatch::Blocked => self.settings.select_timeout,
            };
            if let Ok(Some(outcome)) = tokio::time::timeout(wait, in_flight.next()).await {
                self.finish(outcome, hooks, results, collect_stats)?;
            }
        }
    }

    /// Dispatch queued requests until a cap or the rate limiter blocks
    fn dispatch(
        &mut self,
        in_flight: &mut InFlightSet<T::Handle>,
        hooks: &mut Hooks,
        results: &mut BatchResults,
    ) -> Result<Dispatch, DriverFault> {
        let max_streams = limit(self.settings.max_concurrent_streams);
        let max_host = limit(self.settings.max_host_connections);

        loop {
            if self.queued_keys.is_empty()
                || max_streams.is_some_and(|max| in_flight.len() >= max)
                || !self.pool.has_capacity()
            {
                return Ok(Dispatch::Blocked);
            }
            let Some(destination) = self.next_destination(max_host) else {
                return Ok(Dispatch::Blocked);
            };
            let dispatched_at = match self.limiter.check() {
                Ok(at) => at,
                Err(wait) => return Ok(Dispatch::Throttled(wait)),
            };

            let transport = &self.transport;
            let session = self.session.bind();
            let connection = match self
                .pool
                .acquire(&destination, |d| transport.open(d, session))
            {
                Ok(Some(connection)) => connection,
                Ok(None) => return Ok(Dispatch::Blocked),
                Err(e) => {
                    if let Some(queued) = self.dequeue(&destination) {
                        log::warn!("Cannot open connection for `{}`: {e}", queued.key);
                        let error = TransferError::new(TransferErrorKind::Request, e.to_string());
                        self.record_failure(queued, error, dispatched_at, hooks, results);
                    }
                    continue;
                }
            };
            let Some(queued) = self.dequeue(&destination) else {
                self.pool.discard(connection);
                return Ok(Dispatch::Blocked);
            };

            let slot = self
                .registry
                .register(InFlight {
                    key: queued.key.clone(),
                    destination,
                    url: queued.request.url.clone(),
                    method: queued.request.method.clone(),
                    dispatched_at,
                    collect_headers: queued.collect_headers,
                })
                .map_err(|_| DriverFault::DuplicateInFlight(queued.key.clone()))?;
            log::debug!(
                "Dispatching `{}` ({} {}) on connection {}",
                queued.key,
                queued.request.method,
                queued.request.url,
                connection.id()
            );

            let transport = Arc::clone(&self.transport);
            let request = queued.request;
            let transfer = async move {
                let mut connection = connection;
                let result = transport.perform(connection.handle_mut(), request).await;
                (slot, connection, result)
            };
            in_flight.push(AssertUnwindSafe(transfer).catch_unwind().boxed());
        }
    }

    /// Process a drained transfer
    fn finish(
        &mut self,
        outcome: std::thread::Result<Transfer<T::Handle>>,
        hooks: &mut Hooks,
        results: &mut BatchResults,
        collect_stats: bool,
    ) -> Result<(), DriverFault> {
        let (slot, connection, result) =
            outcome.map_err(|panic| DriverFault::Panicked(panic_message(panic.as_ref())))?;

        let Some(key) = self.registry.resolve(slot).map(str::to_string) else {
            self.pool.discard(connection);
            return Err(DriverFault::UnknownHandle(slot));
        };

        if let Err(error) = &result {
            log::debug!("Request `{key}` failed: {error}");
            hooks.error(&key, error);
        }

        let Some(entry) = self.registry.get(&key).cloned() else {
            self.pool.discard(connection);
            return Err(DriverFault::UnknownHandle(slot));
        };
        let completion = match result {
            Ok(exchange) => Completion {
                key: key.clone(),
                url: entry.url,
                effective_url: exchange.effective_url,
                status: Some(exchange.status),
                headers: entry.collect_headers.then_some(exchange.headers),
                body: exchange.body,
                error: None,
                timings: exchange.timings,
                dispatched_at: entry.dispatched_at,
            },
            Err(error) => Completion {
                key: key.clone(),
                url: entry.url.clone(),
                effective_url: entry.url,
                status: None,
                headers: None,
                body: Bytes::new(),
                error: Some(error),
                timings: Timings::default(),
                dispatched_at: entry.dispatched_at,
            },
        };

        if collect_stats {
            results.stats.record(&key, &completion.timings);
        }

        // pool under the destination the transfer actually ended at
        let effective = Destination::try_from(&completion.effective_url)
            .unwrap_or_else(|_| entry.destination.clone());
        self.pool.release(connection, effective);
        self.registry.take(slot);

        log::debug!(
            "Completed `{key}` with {}",
            completion
                .status
                .map_or_else(|| "error".to_string(), |status| status.to_string())
        );
        results.record(completion);
        if let Some(completion) = results.get(&key) {
            hooks.completed(&key, completion);
        }
        Ok(())
    }

    /// Complete a request that failed before it was dispatched
    fn record_failure(
        &mut self,
        queued: Queued,
        error: TransferError,
        dispatched_at: Instant,
        hooks: &mut Hooks,
        results: &mut BatchResults,
    ) {
        hooks.error(&queued.key, &error);
        let url = queued.request.url;
        let key = queued.key;
        results.record(Completion {
            key: key.clone(),
            url: url.clone(),
            effective_url: url,
            status: None,
            headers: None,
            body: Bytes::new(),
            error: Some(error),
            timings: Timings::default(),
            dispatched_at,
        });
        if let Some(completion) = results.get(&key) {
            hooks.completed(&key, completion);
        }
    }

    /// Drop queued requests and close every pooled handle
    pub(crate) fn shutdown(&mut self) {
        let dropped = self.queued() + self.registry.len();
        if dropped > 0 {
            log::debug!("Dropping {dropped} unfinished request(s)");
        }
        self.drain_queue();
        self.registry.drain();
        self.pool.reset_busy();
        self.pool.clear();
        self.state = DriverState::Idle;
    }
}

impl<T: Transport> std::fmt::Debug for Driver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("state", &self.state)
            .field("queued", &self.queued())
            .field("in_flight", &self.registry.len())
            .field("pool", &self.pool.stats())
            .field("session_shared", &self.session.is_enabled())
            .field("limiter", &self.limiter)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
