//! `weft-server` binary entrypoint.
//!
//! Binds the control-plane listener and serves event streams until
//! interrupted. Binding `localhost:0` selects an ephemeral port; the bound
//! address is printed on start so callers can discover it.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;
use clap::{Parser, ValueEnum};

use weft_core::{init_logging, LogFormat};
use weft_server::Server;

/// Log output format selection.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormatArg {
    /// Pretty-printed logs for development.
    #[default]
    Pretty,
    /// JSON structured logs for production.
    Json,
}

/// The weft control-plane server.
#[derive(Debug, Parser)]
#[command(name = "weft-server", version, about)]
struct Args {
    /// Address to listen on, e.g. `localhost:50051`. Port 0 selects an
    /// ephemeral port.
    #[arg(long)]
    bind: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormatArg,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(match args.log_format {
        LogFormatArg::Pretty => LogFormat::Pretty,
        LogFormatArg::Json => LogFormat::Json,
    });

    let server = Server::bind(&args.bind).await?;
    println!("listening on {}", server.local_addr());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; shutting down");
        }
    }

    Ok(())
}
