//! Bounded, route-partitioned connection pool.
//!
//! Every mutation of the caps happens under one mutex, so the number of
//! connections allocated to a route (leased, idle, or being opened) never
//! exceeds `max_per_route` and the pool-wide count never exceeds `max_total`.
//! Callers that cannot get a slot wait on a condvar until a connection is
//! released or their deadline passes.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::HttpClientError;
use crate::route::Route;
use crate::util::lock_unpoisoned;

/// A transport handle the pool can keep between requests.
pub trait Poolable: Send + 'static {
    /// Whether an idle connection became unusable while parked, for example
    /// because the peer closed it.
    fn is_stale(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_total: usize,
    pub max_per_route: usize,
    /// Hard lifetime of a connection, counted from when it was opened.
    pub time_to_live: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_total: config.max_total_connections.max(1),
            max_per_route: config.max_per_route.max(1),
            time_to_live: config.idle_time_to_live,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections handed out or currently being opened.
    pub leased: usize,
    pub idle: usize,
    pub waiting: usize,
    pub max_total: usize,
}

impl PoolStats {
    pub fn allocated(&self) -> usize {
        self.leased + self.idle
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub leased: usize,
    pub idle: usize,
    pub max_per_route: usize,
}

impl RouteStats {
    pub fn allocated(&self) -> usize {
        self.leased + self.idle
    }
}

struct Entry<C> {
    id: u64,
    route: Route,
    conn: C,
    created_at: Instant,
    last_used: Instant,
    hard_expiry: Option<Instant>,
    expires_at: Option<Instant>,
}

impl<C> Entry<C> {
    fn new(id: u64, route: Route, conn: C, time_to_live: Duration) -> Self {
        let now = Instant::now();
        let hard_expiry = now.checked_add(time_to_live);
        Self {
            id,
            route,
            conn,
            created_at: now,
            last_used: now,
            hard_expiry,
            expires_at: hard_expiry,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    fn mark_released(&mut self, now: Instant, valid_for: Option<Duration>) {
        self.last_used = now;
        let keep_alive_expiry = valid_for.and_then(|valid_for| now.checked_add(valid_for));
        self.expires_at = match (self.hard_expiry, keep_alive_expiry) {
            (Some(hard), Some(keep_alive)) => Some(hard.min(keep_alive)),
            (hard, keep_alive) => hard.or(keep_alive),
        };
    }
}

struct RouteState<C> {
    // Front holds the most recently released connection.
    idle: VecDeque<Entry<C>>,
    allocated: usize,
}

impl<C> Default for RouteState<C> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            allocated: 0,
        }
    }
}

struct PoolState<C> {
    routes: HashMap<Route, RouteState<C>>,
    total: usize,
    waiting: usize,
    next_id: u64,
    shut_down: bool,
}

impl<C: Poolable> PoolState<C> {
    fn take_idle(&mut self, route: &Route, now: Instant) -> Option<Entry<C>> {
        let route_state = self.routes.get_mut(route)?;
        let mut found = None;
        while let Some(entry) = route_state.idle.pop_front() {
            if entry.is_expired(now) || entry.conn.is_stale() {
                trace!(route = %route, id = entry.id, "discarding expired or stale connection");
                route_state.allocated -= 1;
                self.total -= 1;
                continue;
            }
            found = Some(entry);
            break;
        }
        if route_state.allocated == 0 {
            self.routes.remove(route);
        }
        found
    }

    fn try_reserve(&mut self, route: &Route, settings: &PoolSettings) -> bool {
        let allocated = self.routes.get(route).map_or(0, |state| state.allocated);
        if allocated >= settings.max_per_route {
            return false;
        }
        if self.total >= settings.max_total && !self.evict_oldest_idle() {
            return false;
        }
        self.routes.entry(route.clone()).or_default().allocated += 1;
        self.total += 1;
        true
    }

    fn unreserve(&mut self, route: &Route) {
        if let Some(route_state) = self.routes.get_mut(route) {
            route_state.allocated = route_state.allocated.saturating_sub(1);
            if route_state.allocated == 0 {
                self.routes.remove(route);
            }
        }
        self.total = self.total.saturating_sub(1);
    }

    fn evict_oldest_idle(&mut self) -> bool {
        let oldest = self
            .routes
            .iter()
            .filter_map(|(route, state)| state.idle.back().map(|entry| (route, entry.last_used)))
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(route, _)| route.clone());
        let Some(route) = oldest else {
            return false;
        };
        if let Some(entry) = self
            .routes
            .get_mut(&route)
            .and_then(|state| state.idle.pop_back())
        {
            trace!(route = %route, id = entry.id, "evicting idle connection to make room");
            self.unreserve(&route);
            return true;
        }
        false
    }

    fn close_idle_where(&mut self, mut should_close: impl FnMut(&Entry<C>) -> bool) -> usize {
        let mut closed = 0;
        for route_state in self.routes.values_mut() {
            let before = route_state.idle.len();
            route_state.idle.retain(|entry| !should_close(entry));
            let removed = before - route_state.idle.len();
            route_state.allocated -= removed;
            closed += removed;
        }
        self.total -= closed;
        self.routes.retain(|_, state| state.allocated > 0);
        closed
    }
}

struct Shared<C> {
    settings: PoolSettings,
    state: Mutex<PoolState<C>>,
    available: Condvar,
}

impl<C: Poolable> Shared<C> {
    fn give_back(&self, mut entry: Entry<C>, reusable: bool, valid_for: Option<Duration>) {
        let mut state = lock_unpoisoned(&self.state);
        let now = Instant::now();
        if reusable && !state.shut_down {
            entry.mark_released(now, valid_for);
        }
        let keep = reusable && !state.shut_down && !entry.is_expired(now);
        if keep && let Some(route_state) = state.routes.get_mut(&entry.route) {
            trace!(route = %entry.route, id = entry.id, "returning connection to pool");
            route_state.idle.push_front(entry);
        } else {
            trace!(route = %entry.route, id = entry.id, "closing released connection");
            state.unreserve(&entry.route);
            drop(entry);
        }
        drop(state);
        self.available.notify_all();
    }
}

/// Pool of reusable connections partitioned by [`Route`].
pub struct ConnectionPoolManager<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for ConnectionPoolManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Poolable> ConnectionPoolManager<C> {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                state: Mutex::new(PoolState {
                    routes: HashMap::new(),
                    total: 0,
                    waiting: 0,
                    next_id: 0,
                    shut_down: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(PoolSettings::from_config(config))
    }

    pub fn settings(&self) -> PoolSettings {
        self.shared.settings
    }

    /// Leases a connection for `route`, reusing an idle one when possible and
    /// otherwise opening one through `connect` once the caps allow it.
    ///
    /// Blocks for at most `timeout` waiting for a slot. `connect` runs without
    /// the pool lock held; if it fails the reserved slot is given back.
    pub fn acquire<F>(
        &self,
        route: &Route,
        timeout: Duration,
        connect: F,
    ) -> crate::ReqpoolResult<PooledConnection<C>>
    where
        F: FnOnce(&Route) -> crate::ReqpoolResult<C>,
    {
        let started_at = Instant::now();
        let deadline = started_at.checked_add(timeout);
        let settings = self.shared.settings;
        let mut state = lock_unpoisoned(&self.shared.state);

        loop {
            if state.shut_down {
                return Err(HttpClientError::PoolShutDown);
            }

            if let Some(entry) = state.take_idle(route, Instant::now()) {
                drop(state);
                trace!(route = %route, id = entry.id, "reusing pooled connection");
                return Ok(PooledConnection::leased(entry, &self.shared, true));
            }

            if state.try_reserve(route, &settings) {
                let id = state.next_id;
                state.next_id += 1;
                drop(state);

                let reservation = Reservation {
                    shared: &self.shared,
                    route,
                    armed: true,
                };
                let conn = connect(route)?;
                reservation.disarm();
                debug!(route = %route, id, "opened pooled connection");
                let entry = Entry::new(id, route.clone(), conn, settings.time_to_live);
                return Ok(PooledConnection::leased(entry, &self.shared, false));
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return Err(HttpClientError::PoolExhausted {
                    route: route.to_string(),
                    waited_ms: started_at.elapsed().as_millis(),
                });
            }

            state.waiting += 1;
            state = match self.shared.available.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
            state.waiting -= 1;
        }
    }

    /// `reusable = false` destroys the connection; otherwise it is parked
    /// as idle, stamped with the release time.
    pub fn release(&self, conn: PooledConnection<C>, reusable: bool) {
        conn.release(reusable);
    }

    /// Closes idle connections past their lifetime or keep-alive window.
    pub fn close_expired(&self) -> usize {
        let now = Instant::now();
        let closed =
            lock_unpoisoned(&self.shared.state).close_idle_where(|entry| entry.is_expired(now));
        if closed > 0 {
            self.shared.available.notify_all();
            debug!(closed, "closed expired pooled connections");
        }
        closed
    }

    /// Closes connections that have been idle for at least `idle_for`.
    pub fn close_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let closed = lock_unpoisoned(&self.shared.state)
            .close_idle_where(|entry| now.saturating_duration_since(entry.last_used) >= idle_for);
        if closed > 0 {
            self.shared.available.notify_all();
        }
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock_unpoisoned(&self.shared.state);
        let idle = state.routes.values().map(|route| route.idle.len()).sum::<usize>();
        PoolStats {
            leased: state.total - idle,
            idle,
            waiting: state.waiting,
            max_total: self.shared.settings.max_total,
        }
    }

    pub fn route_stats(&self, route: &Route) -> RouteStats {
        let state = lock_unpoisoned(&self.shared.state);
        let (allocated, idle) = state
            .routes
            .get(route)
            .map_or((0, 0), |route| (route.allocated, route.idle.len()));
        RouteStats {
            leased: allocated - idle,
            idle,
            max_per_route: self.shared.settings.max_per_route,
        }
    }

    /// Closes every idle connection and refuses further leases. Connections
    /// still leased are closed when they come back.
    pub fn shutdown(&self) {
        let mut state = lock_unpoisoned(&self.shared.state);
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        let closed = state.close_idle_where(|_| true);
        drop(state);
        self.shared.available.notify_all();
        debug!(closed, "connection pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        lock_unpoisoned(&self.shared.state).shut_down
    }

    fn downgrade(&self) -> Weak<Shared<C>> {
        Arc::downgrade(&self.shared)
    }
}

struct Reservation<'a, C: Poolable> {
    shared: &'a Shared<C>,
    route: &'a Route,
    armed: bool,
}

impl<C: Poolable> Reservation<'_, C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: Poolable> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            lock_unpoisoned(&self.shared.state).unreserve(self.route);
            self.shared.available.notify_all();
        }
    }
}

/// A leased connection. Dropping it without [`release`](Self::release)
/// destroys the underlying transport and frees its slot.
pub struct PooledConnection<C: Poolable> {
    entry: Option<Entry<C>>,
    shared: Arc<Shared<C>>,
    reused: bool,
    valid_for: Option<Duration>,
}

impl<C: Poolable> PooledConnection<C> {
    fn leased(entry: Entry<C>, shared: &Arc<Shared<C>>, reused: bool) -> Self {
        Self {
            entry: Some(entry),
            shared: Arc::clone(shared),
            reused,
            valid_for: None,
        }
    }

    fn entry(&self) -> &Entry<C> {
        match &self.entry {
            Some(entry) => entry,
            None => unreachable!("pooled connection used after release"),
        }
    }

    fn entry_mut(&mut self) -> &mut Entry<C> {
        match &mut self.entry {
            Some(entry) => entry,
            None => unreachable!("pooled connection used after release"),
        }
    }

    pub fn id(&self) -> u64 {
        self.entry().id
    }

    pub fn route(&self) -> &Route {
        &self.entry().route
    }

    pub fn created_at(&self) -> Instant {
        self.entry().created_at
    }

    /// `true` when the connection came out of the idle set.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// How long the connection may sit idle after release.
    pub fn set_valid_for(&mut self, valid_for: Duration) {
        self.valid_for = Some(valid_for);
    }

    pub fn release(mut self, reusable: bool) {
        if let Some(entry) = self.entry.take() {
            self.shared.give_back(entry, reusable, self.valid_for);
        }
    }
}

impl<C: Poolable> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.entry().conn
    }
}

impl<C: Poolable> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.entry_mut().conn
    }
}

impl<C: Poolable> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.shared.give_back(entry, false, None);
        }
    }
}

impl<C: Poolable> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = formatter.debug_struct("PooledConnection");
        if let Some(entry) = &self.entry {
            debug.field("id", &entry.id).field("route", &entry.route);
        }
        debug.field("reused", &self.reused).finish()
    }
}

/// Background sweep that periodically closes expired idle connections.
pub struct IdleConnectionEvictor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    join: Option<JoinHandle<()>>,
}

impl IdleConnectionEvictor {
    pub fn start<C: Poolable>(pool: &ConnectionPoolManager<C>, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let shared = pool.downgrade();
        let join = thread::spawn(move || {
            loop {
                let (stopped, condvar) = &*signal;
                let guard = lock_unpoisoned(stopped);
                let guard = match condvar.wait_timeout_while(guard, interval, |stopped| !*stopped) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
                if *guard {
                    break;
                }
                drop(guard);
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                ConnectionPoolManager { shared }.close_expired();
            }
        });
        Self {
            stop,
            join: Some(join),
        }
    }

    pub fn stop(&mut self) {
        let (stopped, condvar) = &*self.stop;
        *lock_unpoisoned(stopped) = true;
        condvar.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for IdleConnectionEvictor {
    fn drop(&mut self) {
        self.stop();
    }
}
