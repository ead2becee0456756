//! Call Engine Module - UDP voice calls
//!
//! This module handles:
//! - Audio capture (microphone) and playback (speaker)
//! - The UDP datagram channel between the peers
//! - Call sessions with their send and receive loops
//! - The call lifecycle

mod audio;
mod channel;
mod engine;
mod session;
pub mod wire;

#[cfg(test)]
mod testing;

pub use audio::{
    list_devices, AudioBackend, AudioCapture, AudioError, AudioParams, AudioPlayback,
    CaptureEffects, CpalBackend, CpalCapture, CpalPlayback, BYTES_PER_SAMPLE, CHANNELS,
    DEFAULT_SAMPLE_RATE,
};
pub use channel::{
    local_ip, send_end_call_once, ChannelError, DatagramReceiver, DatagramSender, Endpoint,
    ReceiverCloser,
};
pub use engine::{CallController, CallError, CallEvent, CallInfo, CallState, EndReason};
pub use session::{CallSession, SessionOutcome, SessionStopper};
pub use wire::{Packet, WireFormat, END_CALL_SENTINEL};
