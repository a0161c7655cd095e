//! Observer Collector (spec §4.8).
//!
//! Tracks reactive query observers (change-stream/oplog-tailing/polling
//! "live queries"): dedups re-registrations of the same underlying
//! multiplexer, fingerprints which driver strategy backs it, and keeps a
//! bounded, evictable table of health snapshots for the periodic
//! `LiveQueries` telemetry emission.
//!
//! Grounded on `turbomcp-server/src/task_storage.rs`'s bounded table
//! pattern, here keyed by multiplexer identity instead of task id, with the
//! same "evict oldest, prefer already-stopped" bias spec §4.8 asks for.

use apm_core::sanitize::sanitize_db_args;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::collector::{Collector, CollectorStats, LifecycleGuard};

/// Max tracked observers before eviction kicks in (spec §5).
const MAX_TRACKED_OBSERVERS: usize = 5000;
/// Fraction evicted, oldest-first, once the table is over bound.
const EVICTION_FRACTION: f64 = 0.1;
/// How long a stopped observer's record is retained before purge (spec
/// §4.8: "handle stop with 5-min retention before purge").
const STOPPED_RETENTION: Duration = Duration::from_secs(5 * 60);

/// changeStream processing-time thresholds (spec §4.8's "by processing
/// time"): at or below this, `Optimal`; at or below the second, `Good`;
/// past it, `Slow`.
const CHANGE_STREAM_OPTIMAL_PROCESSING: Duration = Duration::from_millis(50);
const CHANGE_STREAM_GOOD_PROCESSING: Duration = Duration::from_millis(250);

/// polling updates-per-minute thresholds (spec §4.8's "by updates-per-
/// minute"): at or above this rate, `Optimal`; above zero, `Good`.
const POLLING_OPTIMAL_RATE_PER_MIN: f64 = 1.0;

/// Driver strategy backing an observer, detected at registration (spec
/// §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStrategy {
    /// MongoDB change streams.
    ChangeStream,
    /// Legacy oplog tailing.
    OplogTail,
    /// Periodic re-polling (no push notifications available).
    Polling,
}

/// Which bucket a fire notification is routed into (spec §4.8's
/// "added-initially / added-live / changed / removed" counters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverEvent {
    /// A document entering the result set.
    Added,
    /// A tracked document changing.
    Changed,
    /// A document leaving the result set.
    Removed,
}

/// Oplog-tailing phase (spec §4.8's driver-health snapshot: "oplog phase
/// and phase age").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverPhase {
    /// Replaying the initial query before tailing begins.
    Querying,
    /// Steady-state tailing the oplog.
    Tailing,
    /// Catching up after falling behind the oplog window.
    CatchingUp,
}

/// Coarse performance rating derived from an observer's recent health
/// (spec §4.8's "performance rating per variant"). Not every variant uses
/// every member: changeStream/oplog rate into `{Optimal, Good, Slow}`,
/// polling rates into `{Optimal, Good, Inefficient}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceRating {
    /// Keeping up with low latency / a healthy update rate.
    Optimal,
    /// Acceptable but not ideal.
    Good,
    /// changeStream/oplog falling behind.
    Slow,
    /// Polling that is wasteful relative to its observed update rate.
    Inefficient,
}

/// Driver-internal health sample (spec §4.8: "at each send tick, for each
/// active observer, sample (when exposed by the driver) oplog phase and
/// phase age, pending fetch backlog, currently-fetching count,
/// blocked-writes-at-steady-state, published doc set size, polling
/// interval, polling throttle, pending polls, unpublished buffer size").
/// Populated fields depend on variant; a driver that doesn't expose a
/// given field leaves it `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverHealthSample {
    /// Oplog-tailing phase, if applicable.
    pub phase: Option<ObserverPhase>,
    /// Queued documents awaiting initial fetch.
    pub pending_fetch_backlog: Option<u64>,
    /// Documents currently being fetched.
    pub currently_fetching: Option<u64>,
    /// Writes blocked behind this observer at steady state.
    pub blocked_writes: Option<u64>,
    /// Size of the published document set.
    pub published_doc_set_size: Option<u64>,
    /// Configured polling interval.
    pub polling_interval: Option<Duration>,
    /// Configured polling throttle (minimum gap between re-polls).
    pub polling_throttle: Option<Duration>,
    /// Polls queued behind an in-flight poll.
    pub pending_polls: Option<u64>,
    /// Buffered-but-not-yet-published change count.
    pub unpublished_buffer_size: Option<u64>,
}

#[derive(Debug, Clone)]
struct ObserverRecord {
    collection: String,
    selector: Value,
    strategy: DriverStrategy,
    registered_at: Instant,
    last_fire_at: Option<Instant>,
    last_processing_time: Option<Duration>,
    handlers_sharing: u64,
    added_initially: u64,
    added_live: u64,
    changed: u64,
    removed: u64,
    live_update_count: u64,
    initial_load_complete: bool,
    health: DriverHealthSample,
    phase_since: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl ObserverRecord {
    fn record_fire(&mut self, event: ObserverEvent, processing_time: Option<Duration>) {
        self.last_fire_at = Some(Instant::now());
        if let Some(t) = processing_time {
            self.last_processing_time = Some(t);
        }
        match (self.initial_load_complete, event) {
            (false, ObserverEvent::Added) => self.added_initially += 1,
            (true, ObserverEvent::Added) => {
                self.added_live += 1;
                self.live_update_count += 1;
            }
            (_, ObserverEvent::Changed) => {
                self.changed += 1;
                self.live_update_count += 1;
            }
            (_, ObserverEvent::Removed) => {
                self.removed += 1;
                self.live_update_count += 1;
            }
        }
    }

    fn updates_per_minute(&self) -> f64 {
        let minutes = self.registered_at.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            0.0
        } else {
            self.live_update_count as f64 / minutes
        }
    }

    fn phase_age(&self) -> Option<Duration> {
        self.phase_since.map(|t| t.elapsed())
    }

    fn lifespan(&self) -> Option<Duration> {
        self.stopped_at.map(|stopped_at| stopped_at.saturating_duration_since(self.registered_at))
    }

    fn performance_rating(&self) -> PerformanceRating {
        match self.strategy {
            DriverStrategy::ChangeStream => match self.last_processing_time {
                Some(t) if t <= CHANGE_STREAM_OPTIMAL_PROCESSING => PerformanceRating::Optimal,
                Some(t) if t <= CHANGE_STREAM_GOOD_PROCESSING => PerformanceRating::Good,
                Some(_) => PerformanceRating::Slow,
                None => PerformanceRating::Optimal,
            },
            DriverStrategy::OplogTail => {
                let blocked = self.health.blocked_writes.unwrap_or(0) > 0;
                let querying = self.health.phase == Some(ObserverPhase::Querying);
                if blocked || querying {
                    PerformanceRating::Slow
                } else if self.health.pending_fetch_backlog.unwrap_or(0) == 0 {
                    PerformanceRating::Optimal
                } else {
                    PerformanceRating::Good
                }
            }
            DriverStrategy::Polling => {
                let inefficient =
                    self.health.pending_polls.unwrap_or(0) > 1 || self.health.blocked_writes.unwrap_or(0) > 0;
                if inefficient {
                    PerformanceRating::Inefficient
                } else {
                    let rate = self.updates_per_minute();
                    if rate >= POLLING_OPTIMAL_RATE_PER_MIN {
                        PerformanceRating::Optimal
                    } else if rate > 0.0 {
                        PerformanceRating::Good
                    } else {
                        PerformanceRating::Inefficient
                    }
                }
            }
        }
    }
}

/// Point-in-time health snapshot for one observer (spec §3/§4.8).
#[derive(Debug, Clone)]
pub struct ObserverHealth {
    /// Collection the observer watches.
    pub collection: String,
    /// Sanitized query selector the observer was registered with.
    pub selector: Value,
    /// Driver strategy backing it.
    pub strategy: DriverStrategy,
    /// How long it has been registered.
    pub age: Duration,
    /// Number of distinct handles sharing this observer's underlying
    /// multiplexer (spec §8: `handlersSharing >= 1`, equal to the number
    /// of distinct handles referring to the same multiplexer).
    pub handlers_sharing: u64,
    /// Documents added before the initial-load fence lifted.
    pub added_initially: u64,
    /// Documents added after the initial-load fence lifted.
    pub added_live: u64,
    /// Tracked documents changed.
    pub changed: u64,
    /// Documents removed from the result set.
    pub removed: u64,
    /// Count of post-initial-load notifications (`added_live` + `changed`
    /// + `removed`).
    pub live_update_count: u64,
    /// Whether its initial load has completed (spec §4.8's "initial-load
    /// fence" — notifications before this point are suppressed upstream).
    pub initial_load_complete: bool,
    /// Latest driver-internal health sample.
    pub health: DriverHealthSample,
    /// How long the observer has held its current oplog phase.
    pub phase_age: Option<Duration>,
    /// Derived performance rating.
    pub rating: PerformanceRating,
    /// Whether the observer has been stopped (retained briefly for a
    /// final snapshot before purge).
    pub stopped: bool,
    /// `stoppedAt - createdAt`, populated once the observer is stopped
    /// (spec §3: "a lifespan computed at termination").
    pub lifespan: Option<Duration>,
}

#[derive(Debug, Default)]
struct ObserverTable {
    records: HashMap<u64, ObserverRecord>,
}

/// Tracks live query observers process-wide (spec §4.8).
#[derive(Debug, Clone)]
pub struct ObserverCollector {
    table: Arc<RwLock<ObserverTable>>,
    next_id: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

/// Opaque handle identifying a registered observer, returned by
/// [`ObserverCollector::register`] and required by every later call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl Default for ObserverCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverCollector {
    /// Build a new, empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(ObserverTable::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            emitted: Arc::new(AtomicU64::new(0)),
            guard: Arc::new(LifecycleGuard::default()),
        }
    }

    /// Register a newly created observer, deduping by `multiplexer_key` so
    /// two registrations for the same underlying driver multiplexer (spec
    /// §4.8: "dedupe by multiplexer identity") share one record and
    /// increment its `handlers-sharing` count rather than being discarded
    /// silently (spec §4.8: "on match, merge — increment handlers-sharing,
    /// fold initial counters"). Returns the id to use for subsequent
    /// `on_fire`/`mark_initial_load_complete`/`stop` calls. `selector` is
    /// sanitized before being stored (spec §3).
    pub fn register(&self, multiplexer_key: u64, collection: &str, selector: &Value, strategy: DriverStrategy) -> ObserverId {
        let mut table = self.table.write();
        if let Some(record) = table.records.get_mut(&multiplexer_key) {
            record.handlers_sharing += 1;
            return ObserverId(multiplexer_key);
        }
        if table.records.len() >= MAX_TRACKED_OBSERVERS {
            evict(&mut table.records, (MAX_TRACKED_OBSERVERS as f64 * EVICTION_FRACTION) as usize);
        }
        table.records.insert(
            multiplexer_key,
            ObserverRecord {
                collection: collection.to_string(),
                selector: sanitize_db_args(selector),
                strategy,
                registered_at: Instant::now(),
                last_fire_at: None,
                last_processing_time: None,
                handlers_sharing: 1,
                added_initially: 0,
                added_live: 0,
                changed: 0,
                removed: 0,
                live_update_count: 0,
                initial_load_complete: false,
                health: DriverHealthSample::default(),
                phase_since: None,
                stopped_at: None,
            },
        );
        ObserverId(multiplexer_key)
    }

    /// Record a notification fired for this observer, routed into the
    /// correct counter depending on the initial-load fence (spec §4.8).
    /// `processing_time`, when known, feeds the changeStream performance
    /// rating.
    pub fn on_fire(&self, id: ObserverId, event: ObserverEvent, processing_time: Option<Duration>) {
        if let Some(record) = self.table.write().records.get_mut(&id.0) {
            record.record_fire(event, processing_time);
        }
    }

    /// Mark the observer's initial load as complete (spec §4.8's
    /// initial-load fence).
    pub fn mark_initial_load_complete(&self, id: ObserverId) {
        if let Some(record) = self.table.write().records.get_mut(&id.0) {
            record.initial_load_complete = true;
        }
    }

    /// Replace an observer's driver-health sample (spec §4.8: "at each
    /// send tick ... sample"). Resets the phase-age clock when `phase`
    /// changes.
    pub fn update_health(&self, id: ObserverId, health: DriverHealthSample) {
        if let Some(record) = self.table.write().records.get_mut(&id.0) {
            if record.health.phase != health.phase {
                record.phase_since = Some(Instant::now());
            }
            record.health = health;
        }
    }

    /// Mark an observer stopped, computing its lifespan (spec §3/§4.8:
    /// "lifespan = stoppedAt - createdAt"). Its record is retained for
    /// [`STOPPED_RETENTION`] (so a final health snapshot can still be
    /// emitted) before [`ObserverCollector::sweep`] purges it.
    pub fn stop_observer(&self, id: ObserverId) {
        if let Some(record) = self.table.write().records.get_mut(&id.0) {
            record.stopped_at = Some(Instant::now());
        }
    }

    /// Snapshot every tracked observer's health (spec §4.8, for periodic
    /// `LiveQueries` telemetry emission).
    #[must_use]
    pub fn snapshot(&self) -> Vec<ObserverHealth> {
        self.table
            .read()
            .records
            .values()
            .map(|r| ObserverHealth {
                collection: r.collection.clone(),
                selector: r.selector.clone(),
                strategy: r.strategy,
                age: r.registered_at.elapsed(),
                handlers_sharing: r.handlers_sharing,
                added_initially: r.added_initially,
                added_live: r.added_live,
                changed: r.changed,
                removed: r.removed,
                live_update_count: r.live_update_count,
                initial_load_complete: r.initial_load_complete,
                health: r.health,
                phase_age: r.phase_age(),
                rating: r.performance_rating(),
                stopped: r.stopped_at.is_some(),
                lifespan: r.lifespan(),
            })
            .collect()
    }

    /// Purge observers stopped longer than [`STOPPED_RETENTION`] ago.
    pub fn sweep(&self) {
        self.table
            .write()
            .records
            .retain(|_, r| r.stopped_at.is_none_or(|t| t.elapsed() < STOPPED_RETENTION));
    }
}

fn evict(records: &mut HashMap<u64, ObserverRecord>, n: usize) {
    let mut by_priority: Vec<(u64, bool, Instant)> =
        records.iter().map(|(k, v)| (*k, v.stopped_at.is_some(), v.registered_at)).collect();
    // Prefer evicting already-stopped observers, then fall back to oldest
    // (spec §4.8: "evict 10% oldest, prefer stopped").
    by_priority.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    for (key, _, _) in by_priority.into_iter().take(n.max(1)) {
        records.remove(&key);
    }
}

/// Stats reported by [`ObserverCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ObserverCollectorStats {
    /// Number of `LiveQueries` snapshots emitted since start.
    pub emitted: u64,
}

impl CollectorStats for ObserverCollectorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for ObserverCollector {
    type Stats = ObserverCollectorStats;

    fn name(&self) -> &'static str {
        "observer"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("observer collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("observer collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        ObserverCollectorStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registering_the_same_multiplexer_key_twice_increments_handlers_sharing() {
        let c = ObserverCollector::new();
        let id1 = c.register(1, "Rooms", &json!({"active": true}), DriverStrategy::ChangeStream);
        let id2 = c.register(1, "Rooms", &json!({"active": true}), DriverStrategy::ChangeStream);
        assert_eq!(id1, id2);
        let snap = c.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].handlers_sharing, 2);
    }

    #[test]
    fn change_stream_rates_by_processing_time() {
        let c = ObserverCollector::new();
        let id = c.register(10, "Rooms", &json!({}), DriverStrategy::ChangeStream);
        c.mark_initial_load_complete(id);
        c.on_fire(id, ObserverEvent::Changed, Some(Duration::from_millis(10)));
        assert_eq!(c.snapshot()[0].rating, PerformanceRating::Optimal);

        c.on_fire(id, ObserverEvent::Changed, Some(Duration::from_millis(500)));
        assert_eq!(c.snapshot()[0].rating, PerformanceRating::Slow);
    }

    #[test]
    fn oplog_tail_rates_slow_when_blocked_writes_or_querying() {
        let c = ObserverCollector::new();
        let id = c.register(11, "Orders", &json!({}), DriverStrategy::OplogTail);
        c.update_health(id, DriverHealthSample { blocked_writes: Some(3), ..Default::default() });
        assert_eq!(c.snapshot()[0].rating, PerformanceRating::Slow);

        c.update_health(
            id,
            DriverHealthSample { phase: Some(ObserverPhase::Querying), ..Default::default() },
        );
        assert_eq!(c.snapshot()[0].rating, PerformanceRating::Slow);

        c.update_health(
            id,
            DriverHealthSample { phase: Some(ObserverPhase::Tailing), pending_fetch_backlog: Some(0), ..Default::default() },
        );
        assert_eq!(c.snapshot()[0].rating, PerformanceRating::Optimal);
    }

    #[test]
    fn polling_rates_inefficient_on_backlog_signals_even_with_high_update_rate() {
        let c = ObserverCollector::new();
        let id = c.register(12, "Legacy", &json!({}), DriverStrategy::Polling);
        c.mark_initial_load_complete(id);
        c.on_fire(id, ObserverEvent::Changed, None);
        c.update_health(id, DriverHealthSample { pending_polls: Some(2), ..Default::default() });
        assert_eq!(c.snapshot()[0].rating, PerformanceRating::Inefficient);
    }

    #[test]
    fn polling_with_no_updates_rates_inefficient() {
        let c = ObserverCollector::new();
        let id = c.register(13, "Legacy", &json!({}), DriverStrategy::Polling);
        let _ = id;
        assert_eq!(c.snapshot()[0].rating, PerformanceRating::Inefficient);
    }

    #[test]
    fn initial_load_fence_routes_fires_into_distinct_counters() {
        let c = ObserverCollector::new();
        let id = c.register(3, "Orders", &json!({}), DriverStrategy::OplogTail);
        c.on_fire(id, ObserverEvent::Added, None);
        assert!(!c.snapshot()[0].initial_load_complete);
        assert_eq!(c.snapshot()[0].added_initially, 1);
        assert_eq!(c.snapshot()[0].live_update_count, 0);

        c.mark_initial_load_complete(id);
        c.on_fire(id, ObserverEvent::Added, None);
        c.on_fire(id, ObserverEvent::Changed, None);
        c.on_fire(id, ObserverEvent::Removed, None);
        let snap = c.snapshot();
        assert!(snap[0].initial_load_complete);
        assert_eq!(snap[0].added_live, 1);
        assert_eq!(snap[0].changed, 1);
        assert_eq!(snap[0].removed, 1);
        assert_eq!(snap[0].live_update_count, 3);
    }

    #[test]
    fn stopped_observer_is_retained_until_swept_and_reports_a_lifespan() {
        let c = ObserverCollector::new();
        let id = c.register(4, "Events", &json!({}), DriverStrategy::ChangeStream);
        c.stop_observer(id);
        let snap = c.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap[0].stopped);
        assert!(snap[0].lifespan.is_some());
        c.sweep();
        // Not enough time has elapsed yet for the retention window.
        assert_eq!(c.snapshot().len(), 1);
    }

    #[test]
    fn selector_is_sanitized_on_registration() {
        let c = ObserverCollector::new();
        let id = c.register(5, "Users", &json!({"password": "hunter2"}), DriverStrategy::ChangeStream);
        let _ = id;
        let snap = c.snapshot();
        assert_ne!(snap[0].selector, json!({"password": "hunter2"}));
    }
}
