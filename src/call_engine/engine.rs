//! Call Controller
//!
//! Owns at most one `CallSession` and drives the call lifecycle
//! `Idle -> InCall -> Ending -> Idle`. Every transition is broadcast as a
//! `CallEvent`.

use super::audio::{AudioBackend, AudioError, CpalBackend};
use super::channel::{send_end_call_once, ChannelError, Endpoint};
use super::session::{CallSession, SessionOutcome, SessionStopper};
use super::wire::WireFormat;
use crate::config::{validate_buffer_size, CallConfig, ConfigError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Invalid endpoint '{0}': host and port are required")]
    InvalidEndpoint(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No endpoint configured")]
    NoEndpoint,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Channel(#[from] ChannelError),
}

// ============================================================================
// CALL STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call, devices and sockets released
    Idle,
    /// Session running
    InCall,
    /// Session is shutting down
    Ending,
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Local,
    Remote,
    IdleTimeout,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    pub session_id: Uuid,
    pub remote: SocketAddr,
    pub local_port: u16,
    pub started_at: DateTime<Utc>,
}

/// Events emitted by the `CallController`
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    CallStarted(CallInfo),
    CallEnded {
        info: CallInfo,
        reason: EndReason,
        duration: Duration,
    },
    Error(String),
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

struct ActiveCall {
    info: CallInfo,
    stopper: SessionStopper,
    format: WireFormat,
    ended_locally: bool,
    /// Hang-up datagram sent by `end_call`
    hangup: Option<JoinHandle<()>>,
}

struct CallSlot {
    state: CallState,
    active: Option<ActiveCall>,
}

struct Inner {
    call: Mutex<CallSlot>,
    config: RwLock<CallConfig>,
    endpoint: RwLock<Option<Endpoint>>,
    backend: Arc<dyn AudioBackend>,
    event_tx: broadcast::Sender<CallEvent>,
    idle: Notify,
}

/// Handle to the call engine. Cheap to clone.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Inner>,
}

impl CallController {
    /// Controller using the system audio devices
    pub fn new(config: CallConfig) -> Self {
        Self::with_backend(config, Arc::new(CpalBackend))
    }

    pub fn with_backend(config: CallConfig, backend: Arc<dyn AudioBackend>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(Inner {
                call: Mutex::new(CallSlot {
                    state: CallState::Idle,
                    active: None,
                }),
                config: RwLock::new(config),
                endpoint: RwLock::new(None),
                backend,
                event_tx,
                idle: Notify::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.inner.call.lock().state
    }

    pub fn current_call(&self) -> Option<CallInfo> {
        self.inner
            .call
            .lock()
            .active
            .as_ref()
            .map(|a| a.info.clone())
    }

    pub fn config(&self) -> CallConfig {
        self.inner.config.read().clone()
    }

    /// Replaces the configuration used by the next call
    pub fn set_config(&self, config: CallConfig) -> Result<(), CallError> {
        config.validate()?;
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Sets the frame size used by the next call
    pub fn configure_buffer_size(&self, bytes: usize) -> Result<(), CallError> {
        let mut config = self.inner.config.write();
        validate_buffer_size(bytes, config.wire_format)?;
        config.buffer_size = bytes;
        Ok(())
    }

    /// Stores the peer used by `start_configured_call`
    pub fn configure_endpoint(&self, host: &str, port: u16) -> Result<(), CallError> {
        let endpoint = Endpoint::new(host.trim(), port);
        if !endpoint.is_complete() {
            return Err(CallError::InvalidEndpoint(endpoint.to_string()));
        }
        tracing::debug!("Endpoint configured: {}", endpoint);
        *self.inner.endpoint.write() = Some(endpoint);
        Ok(())
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.read().clone()
    }

    /// Calls the configured endpoint, listening on the same port number
    pub async fn start_configured_call(&self) -> Result<CallInfo, CallError> {
        let endpoint = self.endpoint().ok_or(CallError::NoEndpoint)?;
        let port = endpoint.port;
        self.start_call(endpoint, port).await
    }

    /// Starts a call to `remote`, receiving on `receive_port` (`0` picks one).
    ///
    /// Fails without side effects when a call is already active or any
    /// device or socket cannot be opened.
    pub async fn start_call(&self, remote: Endpoint, receive_port: u16) -> Result<CallInfo, CallError> {
        if !remote.is_complete() {
            return Err(CallError::InvalidEndpoint(remote.to_string()));
        }
        if self.state() != CallState::Idle {
            tracing::debug!("Ignoring start request, call already active");
            return Err(CallError::AlreadyInCall);
        }

        let config = self.config();
        config.validate()?;

        let remote_addr = remote.resolve().await?;
        let session = CallSession::open(remote_addr, receive_port, &config, self.inner.backend.as_ref())
            .map_err(|e| {
                tracing::error!("Failed to start call to {}: {}", remote, e);
                self.inner.emit(CallEvent::Error(e.to_string()));
                e
            })?;

        let info = CallInfo {
            session_id: session.id(),
            remote: session.remote(),
            local_port: session.local_addr().port(),
            started_at: session.started_at(),
        };

        {
            let mut slot = self.inner.call.lock();
            if slot.state != CallState::Idle {
                drop(slot);
                session.discard();
                return Err(CallError::AlreadyInCall);
            }
            slot.state = CallState::InCall;
            slot.active = Some(ActiveCall {
                info: info.clone(),
                stopper: session.stopper(),
                format: session.format(),
                ended_locally: false,
                hangup: None,
            });
        }

        tracing::info!(
            "Call {} started: {} (listening on {})",
            info.session_id,
            info.remote,
            info.local_port
        );
        self.inner.emit(CallEvent::StateChanged(CallState::InCall));
        self.inner.emit(CallEvent::CallStarted(info.clone()));

        let inner = Arc::clone(&self.inner);
        let session_id = info.session_id;
        tokio::spawn(async move {
            let outcome = session.run().await;
            inner.finish(session_id, outcome).await;
        });

        Ok(info)
    }

    /// Ends the active call. Must be called within a Tokio runtime.
    ///
    /// Sends the hang-up message from a fresh socket and stops both loops.
    /// A call that is already ending is left alone.
    pub fn end_call(&self) -> Result<(), CallError> {
        {
            let mut slot = self.inner.call.lock();
            match slot.state {
                CallState::Idle => return Err(CallError::NoActiveCall),
                CallState::Ending => return Ok(()),
                CallState::InCall => {}
            }
            slot.state = CallState::Ending;

            if let Some(active) = slot.active.as_mut() {
                active.ended_locally = true;

                let (remote, format) = (active.info.remote, active.format);
                active.hangup = Some(tokio::spawn(async move {
                    if let Err(e) = send_end_call_once(remote, format).await {
                        tracing::warn!("Failed to send hang-up: {}", e);
                    }
                }));

                active.stopper.stop();
                tracing::info!("Ending call {}", active.info.session_id);
            }
        }

        self.inner.emit(CallEvent::StateChanged(CallState::Ending));
        Ok(())
    }

    /// Resolves once no call is active
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state() == CallState::Idle {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Runs once the session of `session_id` has returned
    async fn finish(&self, session_id: Uuid, outcome: SessionOutcome) {
        let (active, was_ending) = {
            let mut slot = self.call.lock();
            if !matches!(&slot.active, Some(a) if a.info.session_id == session_id) {
                return;
            }
            let was_ending = slot.state == CallState::Ending;
            slot.state = CallState::Ending;
            (slot.active.take(), was_ending)
        };
        let Some(mut active) = active else {
            return;
        };

        if !was_ending {
            self.emit(CallEvent::StateChanged(CallState::Ending));
        }

        if let Some(hangup) = active.hangup.take() {
            let _ = hangup.await;
        }

        let reason = if active.ended_locally {
            EndReason::Local
        } else {
            match outcome {
                SessionOutcome::PeerEnded => EndReason::Remote,
                SessionOutcome::IdleTimeout => EndReason::IdleTimeout,
                SessionOutcome::Stopped => EndReason::Local,
                SessionOutcome::CaptureFailed | SessionOutcome::ReceiveFailed => EndReason::Failed,
            }
        };
        if reason == EndReason::Failed {
            self.emit(CallEvent::Error(format!("Call failed: {:?}", outcome)));
        }

        let duration = (Utc::now() - active.info.started_at)
            .to_std()
            .unwrap_or_default();

        self.call.lock().state = CallState::Idle;
        tracing::info!(
            "Call {} ended after {:.1}s ({:?})",
            session_id,
            duration.as_secs_f32(),
            reason
        );

        self.emit(CallEvent::CallEnded {
            info: active.info,
            reason,
            duration,
        });
        self.emit(CallEvent::StateChanged(CallState::Idle));
        self.idle.notify_waiters();
    }
}

impl Default for CallController {
    fn default() -> Self {
        Self::new(CallConfig::default())
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("state", &self.state())
            .field("call", &self.current_call())
            .finish()
    }
}
