use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway::bootstrap;
use gateway::config;
use gateway::models::config_doc::{config_from_value, ConfigDocument};
use gateway::models::token::{TokenInput, TokenRecord, TokenUpdate};
use gateway::store::factory::build_storage;
use gateway::store::local::parse_config_text;
use gateway::store::{StorageBackend, CONFIG_LOCK, TOKENS_LOCK};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gateway=info,g2a=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = config::load();
    let args = cli::Cli::parse();
    let timeout = args
        .lock_timeout
        .map(Duration::from_secs)
        .unwrap_or(cfg.lock_timeout);

    let storage = build_storage(&cfg)
        .await
        .with_context(|| format!("failed to initialise '{}' storage", cfg.storage_type))?;

    let result = match args.command {
        Some(cli::Commands::Status) | None => print_status(storage.as_ref()).await,
        Some(cli::Commands::Config { command }) => handle_config_command(command, &storage, timeout).await,
        Some(cli::Commands::Tokens { command }) => handle_token_command(command, &storage, timeout).await,
        Some(cli::Commands::Seed) => run_seed(storage.as_ref(), &cfg.data_dir, timeout).await,
    };

    storage.close().await;
    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_seed(storage: &dyn StorageBackend, data_dir: &Path, timeout: Duration) -> anyhow::Result<()> {
    let report = bootstrap::seed_from_local(storage, data_dir, timeout).await?;
    let describe = |seeded: bool| if seeded { "seeded" } else { "left as is" };
    println!(
        "config: {}, tokens: {}",
        describe(report.config_seeded),
        describe(report.tokens_seeded)
    );
    Ok(())
}

async fn print_status(storage: &dyn StorageBackend) -> anyhow::Result<()> {
    let reachable = storage.verify_connection().await;
    println!("backend:   {}", storage.kind());
    println!("reachable: {}", reachable);
    if !reachable {
        return Ok(());
    }

    match storage.load_config().await? {
        Some(doc) => println!("config:    {} section(s)", doc.len()),
        None => println!("config:    not initialised"),
    }
    match storage.load_tokens().await? {
        Some(pools) => {
            println!("tokens:    {} pool(s)", pools.len());
            for (pool_name, records) in &pools {
                println!("  {:<16} {}", pool_name, records.len());
            }
        }
        None => println!("tokens:    not initialised"),
    }
    Ok(())
}

async fn handle_config_command(
    cmd: cli::ConfigCommands,
    storage: &Arc<dyn StorageBackend>,
    timeout: Duration,
) -> anyhow::Result<()> {
    match cmd {
        cli::ConfigCommands::Show => {
            match storage.try_load_config().await? {
                Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                None => println!("(config not initialised)"),
            }
            Ok(())
        }
        cli::ConfigCommands::Import { file, replace } => {
            let doc = read_config_file(&file)?;
            if replace {
                let guard = storage.acquire_lock(CONFIG_LOCK, timeout).await?;
                storage.save_config(&doc).await?;
                guard.release().await;
                println!("Config replaced ({} section(s))", doc.len());
            } else {
                let merged = bootstrap::merge_config(storage.as_ref(), &doc, timeout).await?;
                println!("Config merged ({} section(s) stored)", merged.len());
            }
            Ok(())
        }
    }
}

async fn handle_token_command(
    cmd: cli::TokenCommands,
    storage: &Arc<dyn StorageBackend>,
    timeout: Duration,
) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::List { pool } => {
            let Some(pools) = storage.try_load_tokens().await? else {
                println!("(tokens not initialised)");
                return Ok(());
            };
            for (pool_name, records) in &pools {
                if pool.as_deref().is_some_and(|p| p != pool_name.as_str()) {
                    continue;
                }
                println!("[{}] {} token(s)", pool_name, records.len());
                for r in records {
                    println!(
                        "  {:<24} {:<10} quota={:<6} used={}",
                        mask(&r.token),
                        r.status.as_str(),
                        r.quota.map(|q| q.to_string()).unwrap_or_else(|| "-".into()),
                        r.use_count.unwrap_or(0),
                    );
                }
            }
            Ok(())
        }
        cli::TokenCommands::Import { pool, file } => {
            let records = read_token_file(&file)?;
            if records.is_empty() {
                anyhow::bail!("no tokens found in {}", file.display());
            }
            let updates: Vec<TokenUpdate> = records
                .into_iter()
                .map(|r| TokenUpdate::from(r.in_pool(&pool)))
                .collect();

            let guard = storage.acquire_lock(TOKENS_LOCK, timeout).await?;
            storage.save_tokens_delta(&updates, &[]).await?;
            guard.release().await;
            println!("Imported {} token(s) into pool '{}'", updates.len(), pool);
            Ok(())
        }
        cli::TokenCommands::Remove { tokens } => {
            let guard = storage.acquire_lock(TOKENS_LOCK, timeout).await?;
            storage.save_tokens_delta(&[], &tokens).await?;
            guard.release().await;
            println!("Removed {} token(s)", tokens.len());
            Ok(())
        }
    }
}

fn read_config_file(path: &Path) -> anyhow::Result<ConfigDocument> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let doc = if is_json {
        let value: Value = serde_json::from_str(&raw).context("invalid JSON config")?;
        config_from_value(value)?
    } else {
        parse_config_text(&raw)?
    };
    Ok(doc)
}

fn read_token_file(path: &Path) -> anyhow::Result<Vec<TokenRecord>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim_start().starts_with('[') {
        let inputs: Vec<TokenInput> = serde_json::from_str(&raw).context("invalid JSON token list")?;
        return Ok(inputs
            .into_iter()
            .map(TokenInput::into_record)
            .filter(|r| !r.token.is_empty())
            .collect());
    }
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(TokenRecord::new)
        .filter(|r| !r.token.is_empty())
        .collect())
}

fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
