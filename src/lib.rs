//! UDP Call - peer-to-peer voice calls over raw UDP
//!
//! Two peers exchange raw PCM16 frames directly, without a server:
//! - `call_engine`: audio devices, datagram channel, sessions and the call controller
//! - `config`: call configuration from defaults, a JSON file and the environment

pub mod call_engine;
pub mod config;
mod cli;

pub use call_engine::{
    CallController, CallError, CallEvent, CallInfo, CallState, EndReason, Endpoint, WireFormat,
};
pub use config::{CallConfig, CallMode, ConfigError};

use anyhow::Context;
use clap::Parser;
use cli::{Args, CallArgs, Command};
use once_cell::sync::OnceCell;
use tokio::io::AsyncBufReadExt;

static TRACING: OnceCell<()> = OnceCell::new();

/// Installs the log subscriber once. `RUST_LOG` adds to the defaults.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        if let Ok(directive) = "udp_call_lib=debug".parse() {
            filter = filter.add_directive(directive);
        }

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

// ============================================================================
// COMMAND LINE
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Command::Ip => {
            let ip = call_engine::local_ip().context("Could not determine local IP")?;
            println!("{ip}");
            Ok(())
        }
        Command::Devices => {
            let (inputs, outputs) = call_engine::list_devices()?;
            println!("Input devices:");
            for name in inputs {
                println!("  {name}");
            }
            println!("Output devices:");
            for name in outputs {
                println!("  {name}");
            }
            Ok(())
        }
        Command::Call(call) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start the async runtime")?;
            let result = runtime.block_on(call_peer(call));
            // The stdin reader may still be blocked on a line.
            runtime.shutdown_timeout(std::time::Duration::from_millis(100));
            result
        }
    }
}

async fn call_peer(args: CallArgs) -> anyhow::Result<()> {
    let mut config = CallConfig::load_or_default(args.config.as_deref())?;
    args.apply(&mut config)?;

    let controller = CallController::new(config);
    let mut events = controller.subscribe();

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::StateChanged(CallState::Idle) => break,
                CallEvent::StateChanged(state) => tracing::debug!("Call state changed: {:?}", state),
                CallEvent::CallStarted(info) => {
                    println!(
                        "Connected to {} (listening on port {}). Press ENTER to hang up.",
                        info.remote, info.local_port
                    );
                }
                CallEvent::CallEnded {
                    reason, duration, ..
                } => {
                    let how = match reason {
                        EndReason::Local => "Call ended",
                        EndReason::Remote => "Peer hung up",
                        EndReason::IdleTimeout => "Peer went silent, call ended",
                        EndReason::Failed => "Call failed",
                    };
                    println!("{} after {}s", how, duration.as_secs());
                }
                CallEvent::Error(err) => eprintln!("Error: {err}"),
            }
        }
    });

    let endpoint = Endpoint::new(args.host.clone(), args.port);
    controller
        .start_call(endpoint.clone(), args.receive_port())
        .await
        .with_context(|| format!("Could not call {endpoint}"))?;

    let hangup = controller.clone();
    tokio::spawn(async move {
        let mut line = String::new();
        let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
        tokio::select! {
            _ = stdin.read_line(&mut line) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        if let Err(e) = hangup.end_call() {
            tracing::debug!("Hang-up ignored: {}", e);
        }
    });

    controller.wait_until_idle().await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;
    Ok(())
}
