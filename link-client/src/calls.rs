//! Call state reconciler.
//!
//! Drives the pure [`CallTracker`] from telephony events and from
//! `call_commands` written by paired devices, then executes the resulting
//! [`CallEffect`]s against the transport and the phone's telephony layer.
//!
//! The tracker sits behind one async mutex that is held while effects run,
//! so events are applied and published in arrival order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use link_core::{CallEffect, CallTracker, CommandDecision, TelephonyAction};
use link_types::{
    now_millis, CallCommand, CallId, CallRecord, ErrorKind, LinkError, StoragePaths,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CallsConfig;
use crate::shutdown::Shutdown;
use crate::transport::{ChildEvent, SyncTransport, TransportError};

/// The phone's telephony controls.
#[async_trait]
pub trait TelephonyControl: Send + Sync {
    /// Pick up the ringing call.
    async fn accept_ringing_call(&self) -> Result<(), String>;

    /// Hang up or decline the current call.
    async fn end_call(&self) -> Result<(), String>;
}

/// Call reconciliation errors.
#[derive(Debug, Error)]
pub enum CallError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A call document could not be encoded or decoded.
    #[error("document error: {0}")]
    Document(#[from] LinkError),

    /// The telephony layer refused an action.
    #[error("telephony action failed: {0}")]
    Telephony(String),

    /// A sweep did not finish in time.
    #[error("call sweep timed out")]
    SweepTimeout,

    /// No authenticated session.
    #[error("not signed in")]
    SignedOut,
}

impl CallError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Transport(e) => e.kind(),
            CallError::Document(e) => e.kind(),
            CallError::Telephony(_) | CallError::SweepTimeout => ErrorKind::Transient,
            CallError::SignedOut => ErrorKind::Policy,
        }
    }
}

/// Why the command listener returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// Shutdown was requested.
    Shutdown,
    /// No call and no command for the idle timeout.
    Idle,
    /// The subscription ended.
    Closed,
}

/// Executes call state against the store and the telephony layer.
pub struct CallStateReconciler {
    transport: Arc<dyn SyncTransport>,
    telephony: Arc<dyn TelephonyControl>,
    tracker: Mutex<CallTracker>,
    config: CallsConfig,
}

impl CallStateReconciler {
    /// Create a reconciler.
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        telephony: Arc<dyn TelephonyControl>,
        config: CallsConfig,
    ) -> Self {
        Self {
            transport,
            telephony,
            tracker: Mutex::new(CallTracker::new(config.tracker_config())),
            config,
        }
    }

    fn paths(&self) -> Result<StoragePaths, CallError> {
        self.transport
            .session_user_id()
            .map(|uid| StoragePaths::for_user(&uid))
            .ok_or(CallError::SignedOut)
    }

    /// Whether a call is ringing or in progress.
    pub async fn is_busy(&self) -> bool {
        self.tracker.lock().await.is_busy()
    }

    /// The call currently tracked.
    pub async fn current(&self) -> Option<CallRecord> {
        self.tracker.lock().await.current().cloned()
    }

    /// An incoming call started ringing. Returns the id paired devices see.
    ///
    /// Records already under `active_calls` are merged first so that a
    /// second ringing broadcast for the same call reuses its id.
    pub async fn on_ringing(
        &self,
        number: &str,
        contact_name: Option<String>,
    ) -> Result<Option<CallId>, CallError> {
        let paths = self.paths()?;
        let remote = match self.transport.list_children(&paths.active_calls()).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "Could not read active calls; deduplicating locally");
                Vec::new()
            }
        };

        let mut tracker = self.tracker.lock().await;
        let now = now_millis();
        for (key, value) in remote {
            match serde_json::from_value::<CallRecord>(value) {
                Ok(record) => tracker.observe_remote(record, now),
                Err(e) => debug!(call = %key, error = %e, "Ignoring unreadable call record"),
            }
        }

        let effects = tracker.ring(number, contact_name, CallId::random(), now);
        if effects.is_empty() {
            debug!("Ringing deduplicated onto existing call");
        }
        self.execute(&paths, effects, None).await?;
        Ok(tracker.current().map(|c| c.call_id.clone()))
    }

    /// The phone went off-hook.
    pub async fn on_off_hook(&self, number: Option<&str>) -> Result<(), CallError> {
        let paths = self.paths()?;
        let mut tracker = self.tracker.lock().await;
        let effects = tracker.off_hook(number, CallId::random(), now_millis());
        self.execute(&paths, effects, None).await
    }

    /// The phone returned to idle.
    pub async fn on_idle(&self) -> Result<(), CallError> {
        let paths = self.paths()?;
        let mut tracker = self.tracker.lock().await;
        let effects = tracker.idle(now_millis());
        self.execute(&paths, effects, None).await
    }

    /// Judge and execute one command from `call_commands`.
    pub async fn handle_command(
        &self,
        command_id: &str,
        command: &CallCommand,
    ) -> Result<CommandDecision, CallError> {
        let paths = self.paths()?;
        let mut tracker = self.tracker.lock().await;
        let (decision, effects) = tracker.apply_command(command_id, command, now_millis());

        match &decision {
            CommandDecision::Apply {
                target,
                action,
                mismatched,
            } => {
                if *mismatched {
                    warn!(
                        requested = %command.call_id,
                        tracked = %target,
                        "Command names a different call; acting on the tracked one"
                    );
                }
                info!(command = command_id, ?action, call = %target, "Applying call command");
            }
            CommandDecision::Stale { age_ms } => {
                info!(command = command_id, age_ms, "Discarding stale call command");
            }
            CommandDecision::Duplicate => {
                debug!(command = command_id, "Call command already handled");
            }
        }

        self.execute(&paths, effects, Some(command)).await?;
        Ok(decision)
    }

    /// Remove orphaned and stale records from `active_calls`.
    pub async fn sweep(&self) -> Result<usize, CallError> {
        let paths = self.paths()?;
        let work = async {
            let mut tracker = self.tracker.lock().await;
            let effects = tracker.sweep(now_millis());
            let removed = effects.len();
            self.execute(&paths, effects, None).await?;
            Ok::<_, CallError>(removed)
        };
        let removed = tokio::time::timeout(self.config.sweep_timeout(), work)
            .await
            .map_err(|_| CallError::SweepTimeout)??;
        if removed > 0 {
            info!(removed, "Swept call records");
        }
        Ok(removed)
    }

    /// Forget all call state (sign-out).
    pub async fn clear(&self) {
        self.tracker.lock().await.clear();
    }

    /// Sweep on an interval until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            info!(interval_secs = period.as_secs(), "Call sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = reconciler.sweep().await {
                    warn!(error = %e, "Call sweep failed");
                }
            }

            info!("Call sweeper stopped");
        })
    }

    /// Consume `call_commands` until shutdown, the subscription ends, or the
    /// idle timeout passes with no call in progress.
    ///
    /// An idle timeout of zero disables the idle exit.
    pub async fn run_command_listener(&self, shutdown: Shutdown) -> Result<ListenerExit, CallError> {
        let paths = self.paths()?;
        let mut stream = self
            .transport
            .listen_children(&paths.call_commands())
            .await?;
        let idle_timeout = self.config.idle_timeout();
        let idle_enabled = !idle_timeout.is_zero();
        info!("Call command listener started");

        let exit = loop {
            let idle = tokio::time::sleep(idle_timeout.max(Duration::from_millis(1)));
            tokio::select! {
                _ = shutdown.wait() => break ListenerExit::Shutdown,
                event = stream.next() => match event {
                    Some(ChildEvent::Added { key, value }) | Some(ChildEvent::Changed { key, value }) => {
                        match serde_json::from_value::<CallCommand>(value) {
                            Ok(command) => {
                                if let Err(e) = self.handle_command(&key, &command).await {
                                    warn!(command = %key, error = %e, "Call command failed");
                                }
                            }
                            Err(e) => warn!(command = %key, error = %e, "Ignoring malformed call command"),
                        }
                    }
                    Some(ChildEvent::Removed { .. }) => {}
                    None => break ListenerExit::Closed,
                },
                _ = idle, if idle_enabled => {
                    if self.is_busy().await {
                        continue;
                    }
                    break ListenerExit::Idle;
                }
            }
        };

        info!(?exit, "Call command listener stopped");
        Ok(exit)
    }

    async fn execute(
        &self,
        paths: &StoragePaths,
        effects: Vec<CallEffect>,
        command: Option<&CallCommand>,
    ) -> Result<(), CallError> {
        for effect in effects {
            match effect {
                CallEffect::Publish(record) => {
                    let value = serde_json::to_value(&record).map_err(LinkError::from)?;
                    self.transport
                        .write(
                            &paths.active_call(&record.call_id),
                            record.call_id.as_str(),
                            value,
                        )
                        .await?;
                }
                CallEffect::Remove(id) => {
                    self.transport.delete(&paths.active_call(&id)).await?;
                }
                CallEffect::Archive(record) => {
                    let value = serde_json::to_value(&record).map_err(LinkError::from)?;
                    self.transport
                        .write(
                            &paths.call_history(&record.call_id),
                            record.call_id.as_str(),
                            value,
                        )
                        .await?;
                }
                CallEffect::Telephony { action, target } => {
                    debug!(?action, call = %target, "Telephony action");
                    let result = match action {
                        TelephonyAction::AcceptRingingCall => {
                            self.telephony.accept_ringing_call().await
                        }
                        TelephonyAction::EndCall => self.telephony.end_call().await,
                    };
                    result.map_err(CallError::Telephony)?;
                }
                CallEffect::MarkProcessed(command_id) => {
                    let Some(command) = command else { continue };
                    let processed = CallCommand {
                        processed: true,
                        ..command.clone()
                    };
                    let value = serde_json::to_value(&processed).map_err(LinkError::from)?;
                    // The tracker already holds the id; a lost mark cannot re-run the command.
                    if let Err(e) = self
                        .transport
                        .write(&paths.call_command(&command_id), &command_id, value)
                        .await
                    {
                        warn!(
                            command = %command_id,
                            error = %e,
                            "Could not mark call command processed"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
