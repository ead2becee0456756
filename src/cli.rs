use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::call_engine::WireFormat;
use crate::config::{validate_buffer_size, CallConfig, CallMode, ConfigError};

/// Peer-to-peer voice calls over raw UDP.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Call a peer. Press ENTER to hang up.
    Call(CallArgs),

    /// Print the local IP address to share with the peer.
    Ip,

    /// List the available audio devices.
    Devices,
}

#[derive(clap::Args, Debug)]
pub struct CallArgs {
    /// Host name or IP address of the peer.
    pub host: String,

    /// UDP port the peer is listening on.
    pub port: u16,

    /// Local UDP port to listen on. Defaults to the peer's port.
    #[clap(long)]
    pub listen_port: Option<u16>,

    /// Bytes per audio frame (even, fits in one datagram).
    #[clap(long)]
    pub buffer_size: Option<usize>,

    #[clap(long)]
    pub sample_rate: Option<u32>,

    /// duplex, capture-only or listen-only.
    #[clap(long)]
    pub mode: Option<CallMode>,

    /// sentinel (default) or tagged. Both peers must agree.
    #[clap(long)]
    pub wire_format: Option<WireFormat>,

    /// End the call after this many seconds without incoming audio.
    #[clap(long)]
    pub idle_timeout: Option<u64>,

    /// JSON config file. Defaults to the platform config directory.
    #[clap(long)]
    pub config: Option<PathBuf>,
}

impl CallArgs {
    /// Port to receive on
    pub fn receive_port(&self) -> u16 {
        self.listen_port.unwrap_or(self.port)
    }

    /// Overlays the command-line flags on `config`
    pub fn apply(&self, config: &mut CallConfig) -> Result<(), ConfigError> {
        if let Some(format) = self.wire_format {
            config.wire_format = format;
        }
        if let Some(bytes) = self.buffer_size {
            validate_buffer_size(bytes, config.wire_format)?;
            config.buffer_size = bytes;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = (secs > 0).then_some(secs);
        }
        config.validate()
    }
}
