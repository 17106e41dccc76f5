//! Pendant Bridge server binary.

use pendant_bridge::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // LOG_LEVEL governs verbosity; RUST_LOG is the fallback for operators
    // used to the conventional name.
    let filter = std::env::var("LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    cli::run().await
}
