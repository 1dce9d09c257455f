use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tagmail::config::{Config, DEFAULT_CONFIG_FILE};
use tagmail::models::User;
use tagmail::replica::ReplicaStore;
use tagmail::store::MailStore;

#[derive(Debug, Parser)]
#[command(name = "tagmail", version, about = "Label-driven mailbox server")]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE, help = "Path to the TOML config")]
    config: PathBuf,
    #[arg(long, global = true, help = "Debug logging")]
    debug: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the mailbox API (default).
    Serve,
    /// Create or update a directory entry.
    AddUser {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        #[arg(long)]
        email: String,
    },
    /// Mirror one mailbox into the replica.
    Sync {
        #[arg(long)]
        owner: String,
    },
}

fn init_tracing(config: &Config, debug: bool) {
    let fallback = if debug { "debug" } else { config.logging.filter.as_str() };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config, cli.debug);

    let store = MailStore::open(&config.database.url)
        .await
        .with_context(|| format!("opening {}", config.database.url))?;
    let replica = ReplicaStore::new(&config.database.replica_url)
        .await
        .with_context(|| format!("opening {}", config.database.replica_url))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let addr: SocketAddr = config
                .server
                .bind
                .parse()
                .with_context(|| format!("invalid bind address `{}`", config.server.bind))?;
            let service = tagmail::build_service(&config, store, replica)?;

            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            };
            tagmail::http::serve(addr, service, shutdown)
                .await
                .context("server failed")?;
        }
        Command::AddUser {
            id,
            first_name,
            last_name,
            email,
        } => {
            let user = User {
                id,
                first_name,
                last_name,
                email,
            };
            store.upsert_user(&user).await?;
            println!("user {} saved", user.id);
        }
        Command::Sync { owner } => {
            let service = tagmail::build_service(&config, store, replica)?;
            let report = service.sync_mailbox(&owner).await?;
            println!(
                "mirrored {}, removed {}, failed {}",
                report.mirrored, report.removed, report.failed
            );
        }
    }

    Ok(())
}
