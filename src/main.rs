use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use hivernage::anvil::AnvilClient;
use hivernage::config::read_config;
use hivernage::core::Core;
use hivernage::server::{self, Server};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(
        short,
        long,
        env = "HIVERNAGE_CONFIG",
        default_value = "hivernage.toml"
    )]
    /// Path to the main configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the hibernation daemon
    Daemon,
    /// Kick hibernated sessions of a user out of the daemon
    Kick {
        #[clap(short, long)]
        user: String,
        /// Only the session with this connection GUID
        #[clap(short, long)]
        guid: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "hivernage=info")
    }

    // Abort on panic (same behavior as in Go)
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{}", panic_info);
        eprintln!("{:?}", backtrace::Backtrace::new());
        std::process::abort();
    }));

    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = read_config(args.config_file)?;

    match args.command {
        Command::Daemon => {
            let accounting = Arc::new(AnvilClient::new(config.anvil_path()));
            let core = Core::new(config, accounting);
            let (exit_tx, exit_rx) = watch::channel(false);
            tokio::spawn(async move {
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(err) => {
                        tracing::error!(error = %err, "cannot install SIGTERM handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => (),
                    _ = sigterm.recv() => (),
                }
                tracing::info!("exit signal received");
                let _ = exit_tx.send(true);
            });
            Server::new(core).run(exit_rx).await?;
        }
        Command::Kick { user, guid } => {
            let count =
                server::kick_request(&config.admin_path(), &user, guid.as_deref()).await?;
            println!("{}", count);
        }
    }

    Ok(())
}
