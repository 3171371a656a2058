//! Per-destination pool of reusable connection handles.
//!
//! Handles travel `pool -> in flight -> pool` on every request, or
//! `pool -> in flight -> dropped` when the transfer future is lost to a driver
//! fault. The pool itself never inspects a handle; staleness is left to the
//! transport behind it.
//!
//! Idle handles are never dropped unless [`ConnectionPool::with_max_idle`]
//! sets a cap. [`ConnectionPool::with_max_busy`] only bounds the handles
//! checked out at once.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::{ErrorKind, Result};

/// A type-safe representation of a pooling boundary: scheme, host and port.
///
/// The host is normalized to lowercase and the port falls back to the
/// scheme's default, so `https://Example.com/` and `https://example.com:443/x`
/// share a destination.
///
/// # Examples
///
/// ```
/// use fanout_lib::Destination;
/// use url::Url;
///
/// let url = Url::parse("https://API.example.com/v1/users").unwrap();
/// let destination = Destination::try_from(&url).unwrap();
/// assert_eq!(destination.to_string(), "https://api.example.com:443");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Destination {
    scheme: String,
    host: String,
    port: u16,
}

impl Destination {
    /// Scheme of the destination, e.g. `https`
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Lowercased host name or IP address
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port or the scheme's default port
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl TryFrom<&Url> for Destination {
    type Error = ErrorKind;

    fn try_from(url: &Url) -> Result<Self> {
        let scheme = url.scheme();
        if !matches!(scheme, "http" | "https") {
            return Err(ErrorKind::UnsupportedScheme(scheme.to_string()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ErrorKind::InvalidUrlHost(url.clone()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ErrorKind::InvalidUrlHost(url.clone()))?;

        Ok(Destination {
            scheme: scheme.to_string(),
            host: host.to_lowercase(),
            port,
        })
    }
}

impl TryFrom<Url> for Destination {
    type Error = ErrorKind;

    fn try_from(url: Url) -> Result<Self> {
        Destination::try_from(&url)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Identifier of a connection handle, unique for the lifetime of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A transport handle together with its pool bookkeeping.
#[derive(Debug)]
pub struct Connection<H> {
    id: ConnectionId,
    /// Destination the handle is pooled under. Updated on release when a
    /// redirect moved the transfer elsewhere.
    destination: Destination,
    /// Destination the handle was checked out for; used for busy accounting
    checked_out_for: Option<Destination>,
    handle: H,
    uses: u64,
    released_at: Instant,
}

impl<H> Connection<H> {
    /// Identifier of this handle
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Destination this handle is currently pooled under
    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Number of requests this handle has been checked out for
    #[must_use]
    pub const fn uses(&self) -> u64 {
        self.uses
    }

    /// Access the transport handle
    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }
}

/// Counters describing the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Idle handles currently pooled
    pub idle: usize,
    /// Handles currently checked out
    pub busy: usize,
    /// Handles created since the pool was built
    pub created: u64,
    /// Checkouts served by an idle handle
    pub reused: u64,
    /// Idle handles dropped to respect a cap
    pub evicted: u64,
}

/// Pool of idle handles keyed by [`Destination`].
#[derive(Debug)]
pub struct ConnectionPool<H> {
    idle: HashMap<Destination, Vec<Connection<H>>>,
    busy: HashMap<Destination, usize>,
    max_idle: Option<usize>,
    max_busy: Option<usize>,
    next_id: u64,
    created: u64,
    reused: u64,
    evicted: u64,
}

impl<H> Default for ConnectionPool<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> ConnectionPool<H> {
    /// Create an unbounded pool
    #[must_use]
    pub fn new() -> Self {
        Self {
            idle: HashMap::new(),
            busy: HashMap::new(),
            max_idle: None,
            max_busy: None,
            next_id: 0,
            created: 0,
            reused: 0,
            evicted: 0,
        }
    }

    /// Cap the number of idle handles kept across all destinations.
    /// `None` keeps every released handle.
    #[must_use]
    pub fn with_max_idle(mut self, max_idle: Option<usize>) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Cap the number of handles checked out across all destinations.
    /// `None` allows any number of concurrent checkouts.
    #[must_use]
    pub fn with_max_busy(mut self, max_busy: Option<usize>) -> Self {
        self.max_busy = max_busy;
        self
    }

    pub(crate) fn set_limits(&mut self, max_idle: Option<usize>, max_busy: Option<usize>) {
        self.max_idle = max_idle;
        self.max_busy = max_busy;
        self.enforce_idle_cap();
    }

    /// Whether another handle may be checked out right now
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.max_busy.is_none_or(|max| self.busy_total() < max)
    }

    /// Check out a handle for `destination`.
    ///
    /// Pops the most recently released idle handle for the destination, or
    /// constructs a new one with `open`. Returns `Ok(None)` while the busy
    /// handle cap is reached. Idle handles are never evicted to make room.
    ///
    /// # Errors
    ///
    /// Returns the error of `open` if a new handle cannot be constructed.
    pub fn acquire<F>(&mut self, destination: &Destination, open: F) -> Result<Option<Connection<H>>>
    where
        F: FnOnce(&Destination) -> Result<H>,
    {
        if !self.has_capacity() {
            return Ok(None);
        }
        if let Some(mut connection) = self.idle.get_mut(destination).and_then(Vec::pop) {
            self.reused += 1;
            connection.uses += 1;
            connection.checked_out_for = Some(destination.clone());
            *self.busy.entry(destination.clone()).or_insert(0) += 1;
            log::debug!("Reusing connection {} for {destination}", connection.id);
            return Ok(Some(connection));
        }

        let handle = open(destination)?;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.created += 1;
        *self.busy.entry(destination.clone()).or_insert(0) += 1;
        log::debug!("Opened connection {id} for {destination}");

        Ok(Some(Connection {
            id,
            destination: destination.clone(),
            checked_out_for: Some(destination.clone()),
            handle,
            uses: 1,
            released_at: Instant::now(),
        }))
    }

    /// Return a handle to the idle pool under `effective`, the destination
    /// the transfer actually ended at (after redirects).
    pub fn release(&mut self, mut connection: Connection<H>, effective: Destination) {
        self.forget_checkout(&mut connection);
        if connection.destination != effective {
            log::debug!(
                "Connection {} moved from {} to {effective} by a redirect",
                connection.id,
                connection.destination
            );
        }
        connection.destination = effective.clone();
        connection.released_at = Instant::now();
        self.idle.entry(effective).or_default().push(connection);
        self.enforce_idle_cap();
    }

    /// Drop a checked out handle without pooling it
    pub fn discard(&mut self, mut connection: Connection<H>) {
        self.forget_checkout(&mut connection);
        log::debug!("Discarding connection {}", connection.id);
    }

    /// Handles currently checked out for `destination`
    #[must_use]
    pub fn busy(&self, destination: &Destination) -> usize {
        self.busy.get(destination).copied().unwrap_or(0)
    }

    /// Handles currently checked out across all destinations
    #[must_use]
    pub fn busy_total(&self) -> usize {
        self.busy.values().sum()
    }

    /// Idle handles pooled under `destination`
    #[must_use]
    pub fn idle(&self, destination: &Destination) -> usize {
        self.idle.get(destination).map_or(0, Vec::len)
    }

    /// Idle handles across all destinations
    #[must_use]
    pub fn idle_total(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    /// Idle plus busy handles
    #[must_use]
    pub fn live(&self) -> usize {
        self.idle_total() + self.busy_total()
    }

    /// Snapshot of the pool counters
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle_total(),
            busy: self.busy_total(),
            created: self.created,
            reused: self.reused,
            evicted: self.evicted,
        }
    }

    /// Close every idle handle
    pub fn clear(&mut self) {
        let closed = self.idle_total();
        self.idle.clear();
        if closed > 0 {
            log::debug!("Closed {closed} idle connection(s)");
        }
    }

    /// Forget busy accounting of handles lost to a driver fault
    pub(crate) fn reset_busy(&mut self) {
        self.busy.clear();
    }

    fn forget_checkout(&mut self, connection: &mut Connection<H>) {
        if let Some(origin) = connection.checked_out_for.take()
            && let Some(count) = self.busy.get_mut(&origin)
        {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.busy.remove(&origin);
            }
        }
    }

    fn enforce_idle_cap(&mut self) {
        let Some(max_idle) = self.max_idle else {
            return;
        };
        while self.idle_total() > max_idle {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    /// Drop the idle handle that was released longest ago
    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .idle
            .iter()
            .filter_map(|(destination, pool)| {
                pool.iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.released_at)
                    .map(|(index, c)| (destination.clone(), index, c.released_at))
            })
            .min_by_key(|(_, _, released_at)| *released_at);

        let Some((destination, index, _)) = oldest else {
            return false;
        };
        if let Some(pool) = self.idle.get_mut(&destination) {
            let connection = pool.remove(index);
            log::warn!(
                "Evicting idle connection {} for {destination} to respect the idle limit",
                connection.id
            );
            if pool.is_empty() {
                self.idle.remove(&destination);
            }
            self.evicted += 1;
        }
        true
    }
}
