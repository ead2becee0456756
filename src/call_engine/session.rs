//! Call Session
//!
//! One live call: a send loop streaming captured frames to the peer and a
//! receive loop playing back what arrives. Both loops watch a shared
//! running flag; a `SessionStopper` clears it and unblocks the receiver.

use super::audio::{AudioBackend, AudioCapture, AudioPlayback};
use super::channel::{unspecified_for, ChannelError, DatagramReceiver, DatagramSender, ReceiverCloser};
use super::engine::CallError;
use super::wire::{Packet, WireFormat};
use crate::config::{CallConfig, CallMode};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// How a session came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Stopped locally
    Stopped,
    /// The peer sent the hang-up message
    PeerEnded,
    /// Nothing arrived within the configured idle timeout
    IdleTimeout,
    /// The microphone failed for good
    CaptureFailed,
    /// Receiving failed while nothing was being sent
    ReceiveFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendExit {
    Stopped,
    CaptureFailed,
    /// No send loop in this mode
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveExit {
    Stopped,
    PeerEnded,
    IdleTimeout,
    Failed,
}

// ============================================================================
// STOPPER
// ============================================================================

/// Ends a running session from any thread
#[derive(Debug, Clone)]
pub struct SessionStopper {
    running: Arc<AtomicBool>,
    closer: ReceiverCloser,
}

impl SessionStopper {
    /// Clears the running flag and unblocks a pending receive. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.closer.close();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

pub struct CallSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    remote: SocketAddr,
    local_addr: SocketAddr,
    mode: CallMode,
    format: WireFormat,
    buffer_size: usize,
    running: Arc<AtomicBool>,
    capture: Option<Box<dyn AudioCapture>>,
    playback: Option<Box<dyn AudioPlayback>>,
    sender: Option<DatagramSender>,
    receiver: DatagramReceiver,
}

impl CallSession {
    /// Binds the sockets and opens the devices `config.mode` needs.
    ///
    /// On error everything opened so far is released again.
    pub fn open(
        remote: SocketAddr,
        receive_port: u16,
        config: &CallConfig,
        backend: &dyn AudioBackend,
    ) -> Result<Self, CallError> {
        let bind_addr = unspecified_for(&remote, receive_port);
        let receiver = DatagramReceiver::bind(
            bind_addr,
            config.wire_format.datagram_capacity(config.buffer_size),
        )?
        .with_idle_timeout(config.idle_timeout());
        let local_addr = receiver.local_addr().map_err(ChannelError::Receive)?;

        let sender = DatagramSender::open(remote, config.wire_format)?;

        let mut playback = if config.mode.plays_back() {
            Some(backend.open_playback(&config.playback_params())?)
        } else {
            None
        };

        let capture = if config.mode.captures() {
            match backend.open_capture(&config.capture_params()) {
                Ok(mut capture) => {
                    if config.effects.any() {
                        let enabled = capture.request_effects(config.effects);
                        tracing::debug!("Capture effects enabled: {:?}", enabled);
                    }
                    Some(capture)
                }
                Err(e) => {
                    if let Some(p) = playback.as_mut() {
                        p.close();
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let id = Uuid::new_v4();
        tracing::info!(
            "Session {} opened: {} -> {} ({}, {})",
            id,
            local_addr,
            remote,
            config.mode,
            config.wire_format
        );

        Ok(Self {
            id,
            started_at: Utc::now(),
            remote,
            local_addr,
            mode: config.mode,
            format: config.wire_format,
            buffer_size: config.buffer_size,
            running: Arc::new(AtomicBool::new(true)),
            capture,
            playback,
            sender: Some(sender),
            receiver,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Address the receive socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn stopper(&self) -> SessionStopper {
        SessionStopper {
            running: Arc::clone(&self.running),
            closer: self.receiver.closer(),
        }
    }

    /// Releases a session that is never going to run
    pub fn discard(mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
        tracing::debug!("Session {} discarded", self.id);
    }

    /// Runs both loops until the call ends. Devices are closed on return.
    pub async fn run(self) -> SessionOutcome {
        let Self {
            id,
            mode,
            format,
            buffer_size,
            running,
            capture,
            playback,
            sender,
            receiver,
            ..
        } = self;

        let closer = receiver.closer();
        let receive_task = tokio::spawn(receive_loop(
            receiver,
            playback,
            Arc::clone(&running),
            format,
        ));

        let (send_exit, idle_sender) = match (capture, sender) {
            (Some(capture), Some(sender)) => {
                let flag = Arc::clone(&running);
                let exit = tokio::task::spawn_blocking(move || {
                    send_loop(capture, sender, &flag, buffer_size)
                })
                .await
                .unwrap_or_else(|e| {
                    tracing::error!("Send loop of session {} panicked: {}", id, e);
                    SendExit::CaptureFailed
                });

                running.store(false, Ordering::SeqCst);
                closer.close();
                (exit, None)
            }
            (capture, sender) => {
                if let Some(mut capture) = capture {
                    capture.close();
                }
                (SendExit::Skipped, sender)
            }
        };

        let receive_exit = receive_task.await.unwrap_or_else(|e| {
            tracing::error!("Receive loop of session {} panicked: {}", id, e);
            ReceiveExit::Failed
        });
        running.store(false, Ordering::SeqCst);

        // Without a send loop the hang-up still goes out from the session socket.
        if let Some(sender) = idle_sender {
            if receive_exit != ReceiveExit::PeerEnded {
                if let Err(e) = sender.send_end_call() {
                    tracing::debug!("Hang-up not sent: {}", e);
                }
            }
        }

        let outcome = match (send_exit, receive_exit) {
            (_, ReceiveExit::PeerEnded) => SessionOutcome::PeerEnded,
            (_, ReceiveExit::IdleTimeout) => SessionOutcome::IdleTimeout,
            (SendExit::CaptureFailed, _) => SessionOutcome::CaptureFailed,
            (SendExit::Skipped, ReceiveExit::Failed) => SessionOutcome::ReceiveFailed,
            _ => SessionOutcome::Stopped,
        };

        tracing::info!("Session {} ({}) finished: {:?}", id, mode, outcome);
        outcome
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local_addr", &self.local_addr)
            .field("mode", &self.mode)
            .field("format", &self.format)
            .finish()
    }
}

// ============================================================================
// LOOPS
// ============================================================================

/// Streams captured frames until the flag clears or the microphone fails.
///
/// Ends with one hang-up datagram and closes the capture device.
fn send_loop(
    mut capture: Box<dyn AudioCapture>,
    mut sender: DatagramSender,
    running: &AtomicBool,
    buffer_size: usize,
) -> SendExit {
    let mut frame = vec![0u8; buffer_size];
    let mut frames_sent: u64 = 0;
    let mut exit = SendExit::Stopped;

    while running.load(Ordering::SeqCst) {
        let len = match capture.read_frame(&mut frame) {
            Ok(0) => continue,
            Ok(len) => len,
            Err(e) if !e.is_fatal() => {
                tracing::debug!("Skipping frame: {}", e);
                continue;
            }
            Err(e) => {
                tracing::error!("Capture failed: {}", e);
                exit = SendExit::CaptureFailed;
                break;
            }
        };

        let audio = &frame[..len];
        if sender.collides_with_sentinel(audio) {
            tracing::warn!("Captured frame equals the hang-up marker; the peer will end the call");
        }

        match sender.send_audio(audio) {
            Ok(_) => frames_sent += 1,
            Err(e) => tracing::debug!("Dropped frame: {}", e),
        }
    }

    if let Err(e) = sender.send_end_call() {
        tracing::debug!("Hang-up not sent: {}", e);
    }
    capture.close();

    tracing::debug!("Send loop stopped after {} frames", frames_sent);
    exit
}

/// Plays back inbound audio until a hang-up, a local stop or a receive error
async fn receive_loop(
    mut receiver: DatagramReceiver,
    mut playback: Option<Box<dyn AudioPlayback>>,
    running: Arc<AtomicBool>,
    format: WireFormat,
) -> ReceiveExit {
    let exit = loop {
        let (payload, from) = match receiver.receive().await {
            Ok(received) => received,
            Err(ChannelError::Closed) => break ReceiveExit::Stopped,
            Err(ChannelError::IdleTimeout(limit)) => {
                tracing::info!("No audio for {:?}, ending call", limit);
                running.store(false, Ordering::SeqCst);
                break ReceiveExit::IdleTimeout;
            }
            Err(e) => {
                tracing::debug!("Receive loop stopped: {}", e);
                break ReceiveExit::Failed;
            }
        };

        match format.classify(payload) {
            Packet::EndCall => {
                tracing::info!("Peer {} ended the call", from);
                running.store(false, Ordering::SeqCst);
                break ReceiveExit::PeerEnded;
            }
            Packet::Audio(pcm) if pcm.is_empty() => {}
            Packet::Audio(pcm) => {
                if let Some(device) = playback.as_mut() {
                    if let Err(e) = device.write_frame(pcm) {
                        if e.is_fatal() {
                            // Keep listening for the hang-up without a speaker.
                            tracing::warn!("Playback stopped: {}", e);
                            device.close();
                            playback = None;
                        } else {
                            tracing::debug!("Dropped inbound frame: {}", e);
                        }
                    }
                }
            }
            Packet::Unknown => tracing::trace!("Ignoring unknown datagram from {}", from),
        }
    };

    if let Some(mut device) = playback {
        device.close();
    }
    exit
}
