//! Collector configuration.
//!
//! Grounded on `mmtk-mmtk-core/src/util/options.rs`'s `MMTKOption<T>`
//! pattern: each field carries a validator and can be overridden from an
//! environment variable, but scaled down to the small option set this
//! collector needs (no CLI-string parser, since this crate has no CLI of
//! its own per `spec.md` §6 "CLI/env: None at the core level", env vars
//! here being the ambient config layer, not a user-facing CLI surface).

use std::env;
use std::str::FromStr;

/// Default page size exponent: pages are `2^K` bytes (`spec.md` §3, default
/// K = 14 ⇒ 16 KiB).
pub const DEFAULT_LOG_PAGE_SIZE: usize = 14;

fn env_override<T: FromStr>(name: &str, default: T, valid: impl Fn(&T) -> bool) -> T {
    match env::var(name) {
        Ok(s) => match s.parse::<T>() {
            Ok(v) if valid(&v) => v,
            Ok(_) => {
                log::warn!("{name}={s:?} failed validation, using default");
                default
            }
            Err(_) => {
                log::warn!("{name}={s:?} could not be parsed, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Collector-wide configuration, read once at `Collector::new` time.
#[derive(Debug, Clone)]
pub struct Options {
    /// Pages are `2^log_page_size` bytes, aligned to their own size.
    pub log_page_size: usize,
    /// Debugging mode: force a full GC before every allocation (`spec.md` §5, §9).
    pub stress_mode: bool,
    /// `GC.disable`'s effect: `ready_to_gc` always returns false (`spec.md` §5).
    pub dont_gc: bool,
    /// Parallel mark worker count. `None` uses the `spec.md` §4.8 formula.
    pub num_workers: Option<usize>,
    /// Fraction of total slots below which growth is scheduled after sweep
    /// (`spec.md` §4.3, default 0.2).
    pub free_min_ratio: f64,
    /// Fraction of total slots above which a page may become a freeing-page
    /// (`spec.md` §4.3/§4.6, default 0.65).
    pub do_heap_free_ratio: f64,
    /// Heap growth multiplier applied to the page count (`spec.md` §4.3,
    /// default 1.8).
    pub heap_growth_factor: f64,
    /// Minimum number of slots the initial heap is grown to cover.
    pub initial_heap_min_slots: usize,
    /// Initial `malloc_limit` floor for the allocation accountant (`spec.md` §4.9).
    pub initial_malloc_limit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            log_page_size: env_override("EMBERGC_LOG_PAGE_SIZE", DEFAULT_LOG_PAGE_SIZE, |&v| {
                (10..=20).contains(&v)
            }),
            stress_mode: env_override("EMBERGC_STRESS", cfg!(feature = "stress_test"), |_| true),
            dont_gc: env_override("EMBERGC_DONT_GC", false, |_| true),
            num_workers: env::var("EMBERGC_WORKERS")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|&n| n > 0),
            free_min_ratio: env_override("EMBERGC_FREE_MIN_RATIO", 0.2, |&v| v > 0.0 && v < 1.0),
            do_heap_free_ratio: env_override("EMBERGC_DO_HEAP_FREE_RATIO", 0.65, |&v| {
                v > 0.0 && v < 1.0
            }),
            heap_growth_factor: env_override("EMBERGC_HEAP_GROWTH_FACTOR", 1.8, |&v| v > 1.0),
            initial_heap_min_slots: env_override(
                "EMBERGC_INITIAL_HEAP_MIN_SLOTS",
                10_000,
                |&v: &usize| v > 0,
            ),
            initial_malloc_limit: env_override(
                "EMBERGC_INITIAL_MALLOC_LIMIT",
                16 * 1024 * 1024,
                |&v: &usize| v > 0,
            ),
        }
    }
}

impl Options {
    pub fn page_size(&self) -> usize {
        1 << self.log_page_size
    }

    /// `spec.md` §4.8: `min(cpus, 8 + (cpus - 8) * 5/8)` on multi-core hosts,
    /// 1 otherwise.
    pub fn resolved_num_workers(&self) -> usize {
        if let Some(n) = self.num_workers {
            return n.max(1);
        }
        let cpus = num_cpus::get();
        if cpus <= 1 {
            1
        } else if cpus <= 8 {
            cpus
        } else {
            (8 + (cpus - 8) * 5 / 8).min(cpus)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_formula() {
        let mut o = Options::default();
        o.num_workers = Some(16);
        assert_eq!(o.resolved_num_workers(), 16);
    }

    #[test]
    fn page_size_matches_exponent() {
        let o = Options {
            log_page_size: 12,
            ..Options::default()
        };
        assert_eq!(o.page_size(), 4096);
    }
}
