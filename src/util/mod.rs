pub mod executor;
pub(crate) mod metrics;
pub mod pool;

/// One-time process setup: logging. Idempotent so tests can call it freely.
pub fn init_globals() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stdout)
        .try_init();
}
