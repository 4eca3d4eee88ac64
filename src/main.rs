use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use termxfer::config::Config;
use termxfer::transfer::session::{run_broker, run_endpoint, FixedAnswer, PermissionPrompt};
use termxfer::transfer::{
    BarObserver, CompressMode, DiscoveryOptions, Requestor, Sender, TerminalBroker,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config_dir>/termxfer/config.toml)
    #[arg(long, global = true, env = "TERMXFER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push files to the terminal's machine
    Send {
        /// Files and directories to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Place files at the same absolute paths on the other side
        #[arg(long)]
        mirror: bool,
        /// Remote destination; a trailing / means "into this directory"
        #[arg(long, default_value = "")]
        dest: String,
        /// Always send whole files
        #[arg(long)]
        no_rsync: bool,
        /// auto, always or never
        #[arg(long)]
        compress: Option<CompressMode>,
        /// Pack everything into a single tar archive
        #[arg(long)]
        archive: bool,
        /// Shared password that skips the permission prompt
        #[arg(long, env = "TERMXFER_PASSWORD")]
        password: Option<String>,
        /// -q drops acknowledgements, -qq drops errors too
        #[arg(short, long, action = clap::ArgAction::Count)]
        quiet: u8,
    },
    /// Pull files from the terminal's machine
    Receive {
        /// Local directory for the pulled files
        #[arg(long)]
        dest: PathBuf,
        /// Remote paths or glob patterns
        #[arg(required = true)]
        specs: Vec<String>,
        #[arg(long, env = "TERMXFER_PASSWORD")]
        password: Option<String>,
    },
    /// Serve the terminal side over stdin/stdout
    Broker {
        /// Directory that ~ and relative names resolve against
        #[arg(long)]
        root_home: Option<PathBuf>,
        /// Accept every transfer without asking
        #[arg(long)]
        yes: bool,
    },
}

/// Asks on the controlling terminal, since stdin carries the protocol.
struct TtyPrompt;

#[async_trait]
impl PermissionPrompt for TtyPrompt {
    async fn ask_yes_no(&self, message: &str) -> bool {
        let message = message.to_string();
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
            let tty = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/tty")?;
            let mut out = tty.try_clone()?;
            write!(out, "{} [y/N] ", message)?;
            out.flush()?;
            let mut line = String::new();
            std::io::BufReader::new(tty).read_line(&mut line)?;
            Ok(matches!(line.trim(), "y" | "Y" | "yes"))
        })
        .await;
        match answer {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(e)) => {
                tracing::warn!("Cannot prompt on /dev/tty, refusing transfer: {}", e);
                false
            }
            Err(e) => {
                tracing::warn!("Prompt task failed: {}", e);
                false
            }
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn report_failures(failures: &[String]) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    for failure in failures {
        eprintln!("{} {}", "failed:".red().bold(), failure);
    }
    anyhow::bail!("{} file(s) failed", failures.len())
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("Cannot determine home directory")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("termxfer=info")),
        )
        .try_init()?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Send {
            paths,
            mirror,
            dest,
            no_rsync,
            compress,
            archive,
            password,
            quiet,
        } => {
            let mut sender_config = config.sender_config();
            sender_config.rsync = !no_rsync;
            sender_config.archive = archive;
            sender_config.quiet = quiet;
            sender_config.bypass_password = password;
            if let Some(mode) = compress {
                sender_config.compress = mode;
            }

            let cwd = std::env::current_dir().context("Cannot determine current directory")?;
            let mut discovery = DiscoveryOptions::new(home_dir()?, cwd);
            discovery.mirror = mirror;
            discovery.remote_base = dest;

            let mut sender = Sender::from_roots(&paths, &discovery, sender_config)?
                .with_observer(Box::new(BarObserver::new()));
            tracing::info!("Sending {} entries as {}", sender.files().len(), sender.id());
            run_endpoint(&mut sender, tokio::io::stdin(), tokio::io::stdout(), ctrl_c()).await?;
            report_failures(sender.failures())?;
            eprintln!("{}", "Transfer complete".green());
        }
        Commands::Receive {
            dest,
            specs,
            password,
        } => {
            std::fs::create_dir_all(&dest)
                .with_context(|| format!("Cannot create {}", dest.display()))?;
            let mut requestor_config = config.requestor_config(&dest);
            requestor_config.bypass_password = password;

            let mut requestor = Requestor::new(&specs, requestor_config)
                .with_observer(Box::new(BarObserver::new()));
            run_endpoint(&mut requestor, tokio::io::stdin(), tokio::io::stdout(), ctrl_c())
                .await?;
            report_failures(requestor.failures())?;
            eprintln!(
                "{} {} file(s) into {}",
                "Received".green(),
                requestor.files().len(),
                dest.display()
            );
        }
        Commands::Broker { root_home, yes } => {
            let fallback = match &root_home {
                Some(h) => h.clone(),
                None => home_dir()?,
            };
            let mut broker_config = config.broker_config(fallback);
            // The flag beats the file
            if let Some(h) = root_home {
                broker_config.home = h;
            }
            let prompt: Arc<dyn PermissionPrompt> = if yes {
                Arc::new(FixedAnswer(true))
            } else {
                Arc::new(TtyPrompt)
            };
            tracing::info!("Serving transfers under {}", broker_config.home.display());
            run_broker(
                TerminalBroker::new(broker_config),
                tokio::io::stdin(),
                tokio::io::stdout(),
                prompt,
                config.sweep_interval(),
            )
            .await?;
        }
    }

    Ok(())
}
