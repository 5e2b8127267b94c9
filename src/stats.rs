//! Profiling counters (`spec.md` §4.10, C10).
//!
//! Grounded on `original_source/gc_ms_profiler.c`'s per-cycle record and
//! growable record array; the wall-clock source is abstracted behind
//! [`Clock`] since `spec.md` §9 notes the original tolerates either a
//! `getrusage`- or `gettimeofday`-style source as long as it's monotonic,
//! here that's `std::time::Instant`.

use std::time::{Duration, Instant};

/// One completed GC cycle's measurements (`spec.md` §4.10).
#[derive(Debug, Clone, Copy)]
pub struct CycleRecord {
    pub gc_time: Duration,
    pub mark_time: Duration,
    pub sweep_time: Duration,
    pub invoke_time_since_start: Duration,
    pub slots_used: usize,
    pub live: usize,
    pub free: usize,
    pub total_objects: usize,
    pub use_bytes: usize,
    pub total_bytes: usize,
    pub malloc_increase: usize,
    pub malloc_limit: usize,
    pub had_finalize: bool,
    pub is_marked: bool,
}

/// Abstracts the profiler's time source so embedders aren't forced onto
/// `Instant` specifically; only monotonicity is required.
pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

const GROWTH_CHUNK: usize = 1000;

/// Growable record array plus the enable/disable/clear control surface
/// (`spec.md` §6 "Profiler.enable/disable/enabled?/clear/raw_data/result/
/// report/total_time").
pub struct Profiler {
    enabled: bool,
    records: Vec<CycleRecord>,
    started_at: Instant,
}

impl Profiler {
    pub fn new(clock: &impl Clock) -> Self {
        Profiler {
            enabled: false,
            records: Vec::with_capacity(GROWTH_CHUNK),
            started_at: clock.now(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Append a record if profiling is enabled; growth is implicit since
    /// `Vec` already amortizes (the `GROWTH_CHUNK` constant documents the
    /// original's `1000, +1000` policy rather than driving a manual realloc).
    pub fn record(&mut self, record: CycleRecord) {
        if self.enabled {
            if self.records.len() == self.records.capacity() {
                self.records.reserve(GROWTH_CHUNK);
            }
            self.records.push(record);
        }
    }

    pub fn raw_data(&self) -> &[CycleRecord] {
        &self.records
    }

    pub fn total_time(&self) -> Duration {
        self.records.iter().map(|r| r.gc_time).sum()
    }

    pub fn time_since_start(&self, clock: &impl Clock) -> Duration {
        clock.now().saturating_duration_since(self.started_at)
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        for (i, r) in self.records.iter().enumerate() {
            out.push_str(&format!(
                "GC {i}: {:?} (mark {:?}, sweep {:?}), live={} free={}\n",
                r.gc_time, r.mark_time, r.sweep_time, r.live, r.free
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> CycleRecord {
        CycleRecord {
            gc_time: Duration::from_millis(1),
            mark_time: Duration::from_micros(500),
            sweep_time: Duration::from_micros(500),
            invoke_time_since_start: Duration::from_secs(1),
            slots_used: 100,
            live: 60,
            free: 40,
            total_objects: 100,
            use_bytes: 6000,
            total_bytes: 10000,
            malloc_increase: 100,
            malloc_limit: 1000,
            had_finalize: false,
            is_marked: true,
        }
    }

    #[test]
    fn records_only_kept_while_enabled() {
        let clock = SystemClock;
        let mut profiler = Profiler::new(&clock);
        profiler.record(sample_record());
        assert_eq!(profiler.raw_data().len(), 0);
        profiler.enable();
        profiler.record(sample_record());
        assert_eq!(profiler.raw_data().len(), 1);
        profiler.disable();
        profiler.record(sample_record());
        assert_eq!(profiler.raw_data().len(), 1);
    }

    #[test]
    fn clear_empties_records_but_not_state() {
        let clock = SystemClock;
        let mut profiler = Profiler::new(&clock);
        profiler.enable();
        profiler.record(sample_record());
        profiler.clear();
        assert!(profiler.raw_data().is_empty());
        assert!(profiler.enabled());
    }

    #[test]
    fn total_time_sums_gc_time() {
        let clock = SystemClock;
        let mut profiler = Profiler::new(&clock);
        profiler.enable();
        profiler.record(sample_record());
        profiler.record(sample_record());
        assert_eq!(profiler.total_time(), Duration::from_millis(2));
    }
}
