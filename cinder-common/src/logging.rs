//! `tracing` initialization shared by all three binaries: an
//! `EnvFilter` plus a `fmt` layer, with an optional JSON switch.

pub fn init(process: &'static str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    tracing::info!(process, "logging initialized");
}
