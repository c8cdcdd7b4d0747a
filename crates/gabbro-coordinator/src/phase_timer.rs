//! Wall-clock and monotonic timing for query lifecycle phases.
//!
//! Wall-clock instants (creation, execution start, end, heartbeat) are what
//! external observers see; elapsed durations are computed exclusively from
//! monotonic readings so they survive clock adjustments.
//!
//! Phase-begin marks are last-write-wins: re-entering a phase (recovery
//! re-enters STARTING) simply overwrites the mark. The end-of-query mark is
//! set once; later stamps are ignored.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

/// Sentinel for an unset mark. Marks store `nanos_since_create + 1` so a
/// mark taken in the creation nanosecond is still distinguishable.
const UNSET: u64 = 0;

/// Records when each lifecycle phase of a query began, plus heartbeats.
///
/// All marks are atomics; concurrent stamping is safe and the last write
/// wins (except `end`, which is first-write-wins).
#[derive(Debug)]
pub struct PhaseTimer {
    create_time: DateTime<Utc>,
    create_instant: Instant,

    waiting_for_resources: AtomicU64,
    dispatching: AtomicU64,
    planning: AtomicU64,
    analysis_begin: AtomicU64,
    analysis_end: AtomicU64,
    starting: AtomicU64,
    running: AtomicU64,
    finishing: AtomicU64,
    end: AtomicU64,

    /// Wall-clock unix microseconds of the last heartbeat.
    heartbeat_micros: AtomicI64,
}

impl PhaseTimer {
    pub fn new() -> Self {
        let create_time = Utc::now();
        Self {
            create_time,
            create_instant: Instant::now(),
            waiting_for_resources: AtomicU64::new(UNSET),
            dispatching: AtomicU64::new(UNSET),
            planning: AtomicU64::new(UNSET),
            analysis_begin: AtomicU64::new(UNSET),
            analysis_end: AtomicU64::new(UNSET),
            starting: AtomicU64::new(UNSET),
            running: AtomicU64::new(UNSET),
            finishing: AtomicU64::new(UNSET),
            end: AtomicU64::new(UNSET),
            heartbeat_micros: AtomicI64::new(create_time.timestamp_micros()),
        }
    }

    // ========================================================================
    // Phase Marks
    // ========================================================================

    pub fn begin_waiting_for_resources(&self) {
        self.stamp(&self.waiting_for_resources);
    }

    pub fn begin_dispatching(&self) {
        self.stamp(&self.dispatching);
    }

    pub fn begin_planning(&self) {
        self.stamp(&self.planning);
    }

    pub fn begin_analysis(&self) {
        self.stamp(&self.analysis_begin);
    }

    pub fn end_analysis(&self) {
        self.stamp(&self.analysis_end);
    }

    pub fn begin_starting(&self) {
        self.stamp(&self.starting);
    }

    pub fn begin_running(&self) {
        self.stamp(&self.running);
    }

    pub fn begin_finishing(&self) {
        self.stamp(&self.finishing);
    }

    /// Stamps the end of the query. Only the first stamp takes effect.
    pub fn end_query(&self) {
        let now = self.now_mark();
        let _ = self
            .end
            .compare_exchange(UNSET, now, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Refreshes the heartbeat to the current wall-clock time.
    pub fn record_heartbeat(&self) {
        self.heartbeat_micros
            .store(Utc::now().timestamp_micros(), Ordering::Relaxed);
    }

    // ========================================================================
    // Wall-Clock Accessors
    // ========================================================================

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    /// Wall-clock instant execution began (STARTING entered), if it has.
    pub fn execution_start_time(&self) -> Option<DateTime<Utc>> {
        self.wall_clock_of(self.mark(&self.starting).or_else(|| self.mark(&self.running)))
    }

    /// Wall-clock instant the query reached a terminal state, if it has.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.wall_clock_of(self.mark(&self.end))
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        let micros = self.heartbeat_micros.load(Ordering::Relaxed);
        Utc.timestamp_micros(micros).single().unwrap_or(self.create_time)
    }

    // ========================================================================
    // Elapsed Durations
    // ========================================================================

    /// Time spent queued before any later phase began.
    pub fn queued_time(&self) -> Duration {
        let end_of_queue = self
            .first_mark(&[
                &self.waiting_for_resources,
                &self.dispatching,
                &self.planning,
                &self.starting,
                &self.running,
                &self.finishing,
                &self.end,
            ])
            .unwrap_or_else(|| self.now_mark());
        Duration::from_nanos(end_of_queue - 1)
    }

    pub fn resource_waiting_time(&self) -> Duration {
        self.phase_time(
            &self.waiting_for_resources,
            &[
                &self.dispatching,
                &self.planning,
                &self.starting,
                &self.running,
                &self.finishing,
                &self.end,
            ],
        )
    }

    pub fn dispatching_time(&self) -> Duration {
        self.phase_time(
            &self.dispatching,
            &[
                &self.planning,
                &self.starting,
                &self.running,
                &self.finishing,
                &self.end,
            ],
        )
    }

    pub fn planning_time(&self) -> Duration {
        self.phase_time(
            &self.planning,
            &[&self.starting, &self.running, &self.finishing, &self.end],
        )
    }

    pub fn analysis_time(&self) -> Duration {
        self.phase_time(&self.analysis_begin, &[&self.analysis_end, &self.end])
    }

    /// Time spent executing: from entering RUNNING (or STARTING, for
    /// queries that fail before running) until the query ended.
    pub fn execution_time(&self) -> Duration {
        let begin = self.mark(&self.running).or_else(|| self.mark(&self.starting));
        match begin {
            Some(begin) => Duration::from_nanos(self.end_or_now().saturating_sub(begin)),
            None => Duration::ZERO,
        }
    }

    pub fn finishing_time(&self) -> Duration {
        self.phase_time(&self.finishing, &[&self.end])
    }

    /// Total wall time from creation until the query ended (or now).
    pub fn elapsed_time(&self) -> Duration {
        Duration::from_nanos(self.end_or_now() - 1)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn stamp(&self, mark: &AtomicU64) {
        mark.store(self.now_mark(), Ordering::Relaxed);
    }

    fn now_mark(&self) -> u64 {
        self.create_instant.elapsed().as_nanos() as u64 + 1
    }

    fn mark(&self, mark: &AtomicU64) -> Option<u64> {
        match mark.load(Ordering::Relaxed) {
            UNSET => None,
            set => Some(set),
        }
    }

    fn first_mark(&self, marks: &[&AtomicU64]) -> Option<u64> {
        marks.iter().find_map(|m| self.mark(m))
    }

    fn end_or_now(&self) -> u64 {
        self.mark(&self.end).unwrap_or_else(|| self.now_mark())
    }

    /// Duration from `begin` until the first of `later_marks` (or the end
    /// of the query, or now). Zero if the phase never began.
    fn phase_time(&self, begin: &AtomicU64, later_marks: &[&AtomicU64]) -> Duration {
        let Some(begin) = self.mark(begin) else {
            return Duration::ZERO;
        };
        let until = self
            .first_mark(later_marks)
            .unwrap_or_else(|| self.end_or_now());
        Duration::from_nanos(until.saturating_sub(begin))
    }

    fn wall_clock_of(&self, mark: Option<u64>) -> Option<DateTime<Utc>> {
        let mark = mark?;
        let offset = chrono::Duration::nanoseconds((mark - 1) as i64);
        Some(self.create_time + offset)
    }
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}
