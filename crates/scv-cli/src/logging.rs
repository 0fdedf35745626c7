use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `SCV_LOG` first, then `RUST_LOG`, then `info`.
///
/// Scheduling events carry `target_id` and `stream_id`; lease events add
/// `user` and `engine`; commits add `frame_version` and `checkpoint_version`.
pub fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SCV_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
