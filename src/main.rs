//! permd - permissions engine daemon

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use permd::commands::{CommandExecutor, Sender};
use permd::node::QueryContext;
use permd::tasks::BackgroundTasks;
use permd::{export, Config, Engine};

/// Permissions and groups engine
#[derive(Parser, Debug)]
#[command(name = "permd", version, about = "Permissions and groups engine")]
struct Args {
    /// TOML config file (PERMD_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read commands from stdin and run them as the console
    Console,
    /// Write every group, track and user as a command script (file must not exist)
    Export { file: PathBuf },
    /// Replay a command script
    Import { file: PathBuf },
    /// Resolve one permission for a user
    Check {
        uuid: Uuid,
        permission: String,
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        world: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "permd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let engine = Engine::open(config).await?;

    match args.command {
        Command::Console => {
            let tasks = BackgroundTasks::start(&engine);
            let executor = CommandExecutor::new(engine.clone());
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let outcome = executor.execute(&Sender::Console, &line).await;
                println!("{}", outcome);
            }
            tasks.shutdown().await;
        }
        Command::Export { file } => {
            let outcome = export::export_to_file(&engine, &file).await;
            println!("{}", outcome);
            if !outcome.is_success() {
                bail!("export failed");
            }
        }
        Command::Import { file } => {
            let executor = CommandExecutor::new(engine.clone());
            let report = export::import_file(&executor, &file).await?;
            for (line_no, line, outcome) in &report.failures {
                println!("line {}: {} -> {}", line_no, line, outcome);
            }
            println!(
                "{} commands succeeded, {} failed",
                report.succeeded,
                report.failed()
            );
        }
        Command::Check {
            uuid,
            permission,
            server,
            world,
        } => {
            let Some(user) = engine.lookup_user(uuid).await? else {
                bail!("unknown user {}", uuid);
            };
            let ctx = QueryContext::from_args(server.as_deref(), world.as_deref());
            let value = engine.has_permission(user.as_ref(), &permission, &ctx);
            println!("{} {} = {} ({})", uuid, permission, value, ctx);
        }
    }

    Ok(())
}
