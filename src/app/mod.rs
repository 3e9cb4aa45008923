use crate::config::Config;
use crate::gateway::GatewayFactory;
use crate::history::MessageHistory;
use crate::model::Jid;
use crate::protocol::ClientFactory;
use crate::session::{ReconnectPolicy, SessionController, SessionOutcome, SessionSettings};
use crate::store::{CredentialStore, FileCredentialStore};
use crate::version::{self, VersionInfo};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const EXIT_LOGGED_OUT: u8 = 1;
pub const EXIT_FATAL: u8 = 2;

pub async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
    }

    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "auth-show" {
            return handle_auth_show(&config).await;
        }
        if command == "auth-clear" {
            return handle_auth_clear(&config).await;
        }
        return Err(format!(
            "unknown command: {command} (expected config-init, auth-show or auth-clear)"
        )
        .into());
    }

    let version = version::fetch_latest(
        &config.session.version_url,
        Duration::from_millis(config.session.version_timeout_ms),
    )
    .await;
    tracing::info!(
        version = %version.version,
        is_latest = version.is_latest,
        "using protocol version"
    );

    let store = Arc::new(FileCredentialStore::new(&config.session.auth_folder));
    let factory = Arc::new(GatewayFactory::new(
        config.session.gateway_addr.clone(),
        Duration::from_millis(config.session.send_timeout_ms),
    ));
    let history = Arc::new(MessageHistory::new(
        config.history.capacity,
        config.history.placeholder_fallback,
    ));
    let controller =
        SessionController::new(store, factory, session_settings(&config, version))
            .with_history(history);

    println!(
        "session harness: auth folder {}, gateway {}",
        config.session.auth_folder, config.session.gateway_addr
    );
    if config.harness.enabled {
        println!(
            "interactive test will target {}",
            Jid::normalize(&config.harness.dest_number)
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
        }
    });

    match run_session(&controller, shutdown_rx).await? {
        SessionOutcome::LoggedOut => {
            eprintln!(
                "logged out: remove {} (or run `auth-clear`) and pair again",
                config.session.auth_folder
            );
            Ok(ExitCode::from(EXIT_LOGGED_OUT))
        }
        SessionOutcome::Shutdown => Ok(ExitCode::SUCCESS),
    }
}

async fn run_session<S, F>(
    controller: &SessionController<S, F>,
    shutdown: watch::Receiver<bool>,
) -> Result<SessionOutcome, Box<dyn std::error::Error>>
where
    S: CredentialStore + ?Sized,
    F: ClientFactory + ?Sized,
{
    let mut states = controller.subscribe_state();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::info!(state = ?state, "session state");
        }
    });
    let outcome = controller.run(shutdown).await;
    watcher.abort();
    Ok(outcome?)
}

fn session_settings(config: &Config, version: VersionInfo) -> SessionSettings {
    SessionSettings {
        version: version.version,
        socket_url: config.session.socket_url.clone(),
        destination: config
            .harness
            .enabled
            .then(|| Jid::normalize(&config.harness.dest_number)),
        settle_delay: config.harness.settle_delay(),
        step_delay: config.harness.step_delay(),
        max_msg_retry_count: config.session.max_msg_retry_count,
        retry_cache_capacity: config.session.retry_cache_capacity,
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(config.reconnect.initial_backoff_ms),
            max: Duration::from_millis(config.reconnect.max_backoff_ms),
            jitter_pct: config.reconnect.jitter_pct,
        },
    }
}

fn handle_config_init() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(ExitCode::SUCCESS)
}

async fn handle_auth_show(config: &Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let store = FileCredentialStore::new(&config.session.auth_folder);
    let state = store.load().await?;
    println!("auth folder: {}", store.folder().display());
    println!("registered: {}", state.is_registered());
    if let Some(id) = state
        .creds
        .get("me")
        .and_then(|me| me.get("id"))
        .and_then(serde_json::Value::as_str)
    {
        println!("account: {id}");
    }
    if state.keys.is_empty() {
        println!("no stored keys");
    }
    for (name, value) in state.keys.iter() {
        println!("{name} ({} bytes)", value.len());
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_auth_clear(config: &Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let store = FileCredentialStore::new(&config.session.auth_folder);
    store.clear().await?;
    println!("Removed credentials in {}", store.folder().display());
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolVersion;

    #[test]
    fn settings_follow_config() {
        let mut config = Config::default();
        config.harness.dest_number = "5511999999999".into();
        config.reconnect.jitter_pct = 0;
        let version = VersionInfo {
            version: ProtocolVersion([2, 3000, 7]),
            is_latest: true,
        };

        let settings = session_settings(&config, version);
        assert_eq!(settings.version, ProtocolVersion([2, 3000, 7]));
        assert_eq!(
            settings.destination.as_ref().map(Jid::as_str),
            Some("5511999999999@s.whatsapp.net")
        );
        assert_eq!(settings.settle_delay, Duration::from_millis(2000));
        assert_eq!(settings.reconnect.initial, Duration::from_millis(1000));
        assert_eq!(settings.retry_cache_capacity, 1024);
        assert_eq!(settings.reconnect.max, Duration::from_millis(30_000));

        config.harness.enabled = false;
        assert!(session_settings(&config, version).destination.is_none());
    }
}
