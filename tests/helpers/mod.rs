#![allow(dead_code)]

pub mod mock_h2_server;
pub mod mock_server;
pub mod tls;

/// Install a subscriber once; `RUST_LOG=guise=debug` shows client logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
