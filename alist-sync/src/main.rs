//! alist-sync binary: CLI front-end over `alist-sync-core`. Grounded on
//! `backup-agent/src/main.rs`'s `clap::Parser` + `tokio::main` shape,
//! adapted to the `sync`/`check`/`test-config`/`get-info`/`test-ignore`
//! subcommands spec.md §6 names.

use std::path::PathBuf;
use std::process::ExitCode;

use alist_sync_core::checker::PendingIntent;
use alist_sync_core::config::Config;
use alist_sync_core::scheduler;
use alist_sync_core::util::logger;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "Synchronizes file trees across alist-like mount points", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine (daemon or one-shot per config).
    Sync {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Forces single-threaded execution for reproducibility.
        #[arg(long)]
        debug: bool,
    },
    /// Dry run: print a table of planned actions, no transfers.
    Check {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Parse and echo the effective configuration.
    TestConfig {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Stat a single upstream path.
    GetInfo {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        path: String,
    },
    /// Evaluate one glob pattern against one path.
    TestIgnore { path: String, pattern: String },
}

fn config_path(arg: Option<PathBuf>) -> PathBuf {
    arg.or_else(|| std::env::var("ALIST_SYNC_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./config.yaml"))
}

fn load_config(arg: Option<PathBuf>) -> anyhow::Result<Config> {
    Ok(Config::load_from_yaml(&config_path(arg))?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    match args.command {
        Commands::Sync { config, debug } => {
            let mut cfg = load_config(config)?;
            if debug {
                cfg.debug = true;
            }
            let _guard = logger::init(if cfg.debug { "debug" } else { "info" }, cfg.logs.as_ref())?;
            tracing::info!(name = %cfg.name, "starting alist-sync");

            let shutdown = CancellationToken::new();
            let shutdown_for_signal = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                shutdown_for_signal.cancel();
            });

            scheduler::run(cfg.clone(), cfg.name.clone(), false, shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { config } => {
            let cfg = load_config(config)?;
            let _guard = logger::init("info", cfg.logs.as_ref())?;

            let clients = scheduler::build_clients(&cfg)?;
            let persistence = scheduler::build_persistence(&cfg).await?;
            let locks = std::sync::Arc::new(dashmap::DashSet::new());

            let mut total = 0usize;
            for group in &cfg.sync_groups {
                let runner = scheduler::GroupRunner::new(group.clone(), cfg.name.clone());
                let intents = runner
                    .run_cycle(&cfg, &clients, &persistence, &locks, None)
                    .await?;
                for intent in &intents {
                    match intent {
                        PendingIntent::Accepted(w) => {
                            println!(
                                "{group}\t{kind:?}\t{source}\t{target}\t{size}",
                                group = group.name,
                                kind = w.kind,
                                source = w.source_uri.as_deref().unwrap_or("-"),
                                target = w.target_uri,
                                size = w.source_size,
                            );
                            total += 1;
                        }
                        PendingIntent::Rejected(e) => {
                            println!("{}\tREJECTED\t{e}", group.name);
                            total += 1;
                        }
                    }
                }
            }
            eprintln!("{total} planned action(s)");
            Ok(ExitCode::SUCCESS)
        }
        Commands::TestConfig { config } => {
            let cfg = load_config(config)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::GetInfo { config, path } => {
            let cfg = load_config(config)?;
            let _guard = logger::init("info", cfg.logs.as_ref())?;
            let Some(server) = cfg.server_for_uri(&path) else {
                eprintln!("no configured server matches {path}");
                return Ok(ExitCode::FAILURE);
            };
            let client = alist_sync_core::client::PathClient::new(server.base_url.clone(), server)?;
            let relative = url::Url::parse(&path)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| path.clone());
            match client.stat(&relative).await? {
                Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
                None => {
                    eprintln!("not found: {path}");
                    return Ok(ExitCode::FAILURE);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::TestIgnore { path, pattern } => {
            let glob = globset::Glob::new(&pattern)?.compile_matcher();
            let matched = glob.is_match(&path);
            println!("{matched}");
            Ok(if matched { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}
