//! Optional built-in logger wiring, grounded on
//! `mmtk-mmtk-core/src/util/logger.rs`: when the `builtin_env_logger` feature
//! is enabled the collector initializes `env_logger` itself on first use, so
//! embedders get `RUST_LOG`-driven diagnostics without wiring up a logger of
//! their own; embedders who want control over their global logger disable
//! the default feature and initialize one before touching this crate.

/// Attempt to init an `env_logger` for this collector. Does nothing if the
/// `builtin_env_logger` feature is disabled.
pub fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );
            match result {
                Ok(()) => log::debug!("embergc initialized the logger."),
                Err(e) => log::debug!("embergc failed to initialize the built-in env_logger: {e}"),
            }
        } else {
            log::debug!("embergc didn't initialize the built-in env_logger (feature disabled).");
        }
    }
}
