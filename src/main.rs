mod app;
mod config;
mod dispatch;
mod gateway;
mod harness;
mod history;
mod model;
mod protocol;
mod session;
mod store;
mod version;

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    match app::run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "fatal");
            ExitCode::from(app::EXIT_FATAL)
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
