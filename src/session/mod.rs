use crate::dispatch;
use crate::harness::{DestinationSender, HarnessReport, InteractiveHarness};
use crate::history::{MessageHistory, MessageResolver, PlaceholderResolver};
use crate::model::{AuthState, ClientEvent, ConnectionEvent, Jid};
use crate::protocol::{
    ClientConfig, ClientFactory, Connection, ProtocolClient, ProtocolVersion, RetryCounterCache,
};
use crate::store::{CredentialStore, CredsWriter, StoreError};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    ClosedReconnecting,
    /// Absorbing: credentials were revoked.
    ClosedTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    LoggedOut,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Delay before the next connection attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub jitter_pct: u8,
}

impl ReconnectPolicy {
    /// `failures` counts consecutive attempts that never reached `Open`;
    /// zero means the previous connection was healthy, so retry at once.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(16);
        let base = self.initial.saturating_mul(1u32 << exp).min(self.max);
        let jitter_ms = base.as_millis() as u64 * u64::from(self.jitter_pct) / 100;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub version: ProtocolVersion,
    pub socket_url: Option<String>,
    /// `None` leaves the interactive test disabled.
    pub destination: Option<Jid>,
    pub settle_delay: Duration,
    pub step_delay: Duration,
    pub max_msg_retry_count: u32,
    pub retry_cache_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

enum ConnectionEnd {
    Reconnect { reached_open: bool },
    LoggedOut,
    Shutdown,
}

pub struct SessionController<S: ?Sized, F: ?Sized> {
    writer: CredsWriter<S>,
    factory: Arc<F>,
    settings: SessionSettings,
    resolver: Arc<dyn MessageResolver>,
    history: Option<Arc<MessageHistory>>,
    retry_cache: RetryCounterCache,
    state_tx: watch::Sender<SessionState>,
}

impl<S, F> SessionController<S, F>
where
    S: CredentialStore + ?Sized,
    F: ClientFactory + ?Sized,
{
    pub fn new(store: Arc<S>, factory: Arc<F>, settings: SessionSettings) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let retry_cache = RetryCounterCache::with_capacity(settings.retry_cache_capacity);
        Self {
            writer: CredsWriter::new(store),
            factory,
            settings,
            resolver: Arc::new(PlaceholderResolver),
            history: None,
            retry_cache,
            state_tx,
        }
    }

    /// Records inbound messages and answers retransmission lookups from them.
    pub fn with_history(mut self, history: Arc<MessageHistory>) -> Self {
        self.resolver = history.clone();
        self.history = Some(history);
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "session state changed");
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            version: self.settings.version,
            socket_url: self.settings.socket_url.clone(),
            resolver: self.resolver.clone(),
            retry_cache: self.retry_cache.clone(),
            max_msg_retry_count: self.settings.max_msg_retry_count,
        }
    }

    /// Keeps the session connected until logout or shutdown. Only credential
    /// store failures end it with an error.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionOutcome, SessionError> {
        let mut failures: u32 = 0;
        loop {
            self.set_state(SessionState::Connecting);

            let delay = self.settings.reconnect.delay_for(failures);
            if !delay.is_zero() {
                tracing::info!(delay_ms = delay.as_millis() as u64, attempt = failures + 1, "waiting before reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_requested(&mut shutdown) => return Ok(SessionOutcome::Shutdown),
                }
            }

            let auth = self.writer.store().load().await?;
            if !auth.is_registered() {
                tracing::info!("no registered session yet, pairing required");
            }

            let connection = match self.factory.create(auth.clone(), self.client_config()).await {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::warn!(error = %err, "protocol client failed to start");
                    self.set_state(SessionState::ClosedReconnecting);
                    failures = failures.saturating_add(1);
                    continue;
                }
            };

            match self.drive(connection, auth, &mut shutdown).await? {
                ConnectionEnd::Reconnect { reached_open } => {
                    failures = if reached_open {
                        0
                    } else {
                        failures.saturating_add(1)
                    };
                    tracing::info!("reconnecting");
                }
                ConnectionEnd::LoggedOut => {
                    self.set_state(SessionState::ClosedTerminal);
                    return Ok(SessionOutcome::LoggedOut);
                }
                ConnectionEnd::Shutdown => return Ok(SessionOutcome::Shutdown),
            }
        }
    }

    /// Consumes one connection's events until it closes. The client is fully
    /// closed before this returns.
    async fn drive(
        &self,
        connection: Connection,
        mut auth: AuthState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionEnd, SessionError> {
        let Connection { client, mut events } = connection;
        let mut reached_open = false;
        let mut harness_task: Option<JoinHandle<HarnessReport>> = None;

        let end = loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => break Ok(ConnectionEnd::Shutdown),
                event = events.recv() => event,
            };
            let Some(event) = event else {
                tracing::warn!("event stream ended without a close notification");
                self.set_state(SessionState::ClosedReconnecting);
                break Ok(ConnectionEnd::Reconnect { reached_open });
            };

            match event {
                ClientEvent::Connection(ConnectionEvent::Qr { code }) => {
                    tracing::info!(qr = %code, "QR code issued, scan it from the phone to pair");
                }
                ClientEvent::Connection(ConnectionEvent::Open { user_id }) => {
                    reached_open = true;
                    self.set_state(SessionState::Open);
                    tracing::info!(user = user_id.as_deref().unwrap_or("unknown"), "connected");
                    if harness_task.is_none() {
                        harness_task = self.spawn_harness(client.clone());
                    }
                }
                ClientEvent::Connection(ConnectionEvent::Closed { reason }) => {
                    if reason.is_logged_out() {
                        tracing::error!(reason = %reason, "logged out, re-pair to continue");
                        break Ok(ConnectionEnd::LoggedOut);
                    }
                    tracing::warn!(reason = %reason, "connection closed");
                    self.set_state(SessionState::ClosedReconnecting);
                    break Ok(ConnectionEnd::Reconnect { reached_open });
                }
                ClientEvent::CredsUpdate(update) => {
                    auth.apply(&update);
                    if let Err(err) = self.writer.persist(auth.clone()).await {
                        tracing::error!(error = %err, "failed to persist credentials");
                        break Err(err.into());
                    }
                }
                ClientEvent::Messages(batch) => {
                    if let Some(history) = &self.history {
                        history.record_all(&batch.messages);
                    }
                    dispatch::dispatch(&batch);
                }
            }
        };

        if let Some(task) = harness_task {
            if !task.is_finished() {
                tracing::debug!("aborting interactive test for closed connection");
                task.abort();
            }
        }
        client.close().await;
        end
    }

    fn spawn_harness(&self, client: Arc<dyn ProtocolClient>) -> Option<JoinHandle<HarnessReport>> {
        let destination = self.settings.destination.clone()?;
        let settle_delay = self.settings.settle_delay;
        let harness = InteractiveHarness::new(self.settings.step_delay);
        let history = self.history.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(settle_delay).await;
            let sender = DestinationSender::new(client, destination).with_history(history);
            tracing::info!(to = %sender.jid(), "starting interactive message test");
            let report = harness.run(&sender).await;
            if report.is_complete() {
                tracing::info!("interactive message test complete");
            } else {
                tracing::warn!(
                    error = report.failure().map(ToString::to_string).unwrap_or_default(),
                    delivered = report.message_keys().len(),
                    "interactive message test stopped early"
                );
            }
            report
        }))
    }
}

/// Resolves once shutdown is signalled; never resolves if the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
