use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use core_types::config::{self, AppConfig};
use indicatif::{ProgressBar, ProgressStyle};
use search_core::{Engine, Scope, SearchMessage};
use tracing_subscriber::EnvFilter;

/// FlashFind CLI: build, query, and inspect the volume indexes without
/// a UI shell.
#[derive(Parser, Debug)]
#[command(name = "flashfind", version, about = "FlashFind command-line client")]
struct Cli {
    /// Override the config file path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the index directory.
    #[arg(long)]
    index_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build (or rebuild) volume indexes and persist them.
    Build {
        /// Drives to build (defaults to every discovered fixed drive).
        #[arg(long, num_args = 0..)]
        drive: Vec<char>,
        /// Build from explicit directory roots instead of a raw volume
        /// (always the path taken on non-NTFS hosts).
        #[arg(long, num_args = 0..)]
        root: Vec<String>,
    },

    /// Run a search query and stream results to stdout.
    Search {
        /// Query string (Everything-style syntax).
        query: String,
        /// Scope targets, e.g. `D:` or `C:\Users\me\Documents`.
        #[arg(long, num_args = 0..)]
        scope: Vec<String>,
        /// Stop after this many results (0 = unlimited).
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        /// Output as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Show per-volume index statistics.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete a volume's index (memory and disk); it rebuilds on the
    /// next build or search.
    Purge {
        #[arg(long)]
        drive: char,
    },

    /// Show or edit the config on disk.
    Config {
        #[command(subcommand)]
        sub: ConfigCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Print the effective config path and contents.
    Show,
    /// Add a system-volume allowlist root.
    AllowPath { path: String },
    /// Toggle Everything mode (keywords match paths as well as names).
    SetEverything {
        #[arg(value_parser = clap::value_parser!(bool))]
        enabled: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let index_dir = cli.index_dir.clone().unwrap_or_else(config::index_dir);
    let cfg = config::load_or_create(&config_path)?;

    match cli.command {
        Commands::Build { drive, root } => {
            cmd_build(cfg, config_path, index_dir, drive, root)
        }
        Commands::Search {
            query,
            scope,
            limit,
            json,
        } => cmd_search(cfg, config_path, index_dir, &query, scope, limit, json),
        Commands::Status { json } => cmd_status(cfg, index_dir, json),
        Commands::Purge { drive } => {
            let mut engine = Engine::new(cfg, Some(config_path), index_dir);
            engine.load_persisted();
            engine.purge_volume(drive.to_ascii_uppercase())?;
            println!("{} {}:", style("Purged").green(), drive.to_ascii_uppercase());
            Ok(())
        }
        Commands::Config { sub } => cmd_config(cfg, config_path, sub),
    }
}

fn spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn cmd_build(
    cfg: AppConfig,
    config_path: PathBuf,
    index_dir: PathBuf,
    drives: Vec<char>,
    roots: Vec<String>,
) -> Result<()> {
    let mut engine = Engine::new(cfg, Some(config_path), index_dir);

    if !roots.is_empty() {
        let drive = drives.first().copied().unwrap_or('D');
        let bar = spinner(format!("indexing {} root(s)...", roots.len()));
        engine.build_volume_from_roots(drive, &roots)?;
        engine.save_volume(drive.to_ascii_uppercase())?;
        bar.finish_and_clear();
    } else {
        let targets: Vec<char> = if drives.is_empty() {
            ntfs_watcher::volumes::discover_volumes()
                .into_iter()
                .map(|v| v.drive)
                .collect()
        } else {
            drives.into_iter().map(|d| d.to_ascii_uppercase()).collect()
        };
        if targets.is_empty() {
            println!(
                "{}",
                style("No volumes discovered; use --drive or --root.").yellow()
            );
            return Ok(());
        }
        for drive in targets {
            let bar = spinner(format!("indexing {drive}: ..."));
            match engine.build_volume(drive) {
                Ok(()) => {
                    engine.save_volume(drive)?;
                    bar.finish_and_clear();
                }
                Err(err) => {
                    bar.finish_and_clear();
                    eprintln!("{} {drive}: {err}", style("Build failed for").red());
                }
            }
        }
    }

    print_stats(&engine.stats(), false)?;
    engine.shutdown();
    Ok(())
}

fn cmd_search(
    cfg: AppConfig,
    config_path: PathBuf,
    index_dir: PathBuf,
    query: &str,
    scope: Vec<String>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let mut engine = Engine::new(cfg, Some(config_path), index_dir);
    engine.load_persisted();

    let scope = if scope.is_empty() {
        let drives = engine.drives();
        if drives.is_empty() {
            anyhow::bail!("no indexed volumes; run `flashfind build` first");
        }
        Scope::drives(drives)
    } else {
        Scope { targets: scope }
    };

    let (mut handle, rx) = engine.search(query, scope);
    let mut shown = 0usize;
    let mut total = 0usize;

    'outer: while let Ok(message) = rx.recv() {
        match message {
            SearchMessage::Batch(batch) => {
                for rec in batch.records {
                    total += 1;
                    if limit != 0 && shown >= limit {
                        handle.cancel();
                        break 'outer;
                    }
                    shown += 1;
                    if json {
                        println!("{}", serde_json::to_string(&rec)?);
                    } else {
                        let kind = if rec.is_dir { "<dir>" } else { "     " };
                        println!("{kind} {}", rec.full_path);
                    }
                }
            }
            SearchMessage::Finished(elapsed) => {
                if !json {
                    println!(
                        "{}",
                        style(format!("{total} result(s) in {elapsed:.3}s")).dim()
                    );
                }
                break;
            }
            SearchMessage::Error(message) => {
                anyhow::bail!("search failed: {message}");
            }
        }
    }

    handle.wait();
    engine.shutdown();
    Ok(())
}

fn cmd_status(cfg: AppConfig, index_dir: PathBuf, json: bool) -> Result<()> {
    let mut engine = Engine::new(cfg, None, index_dir);
    engine.load_persisted();
    print_stats(&engine.stats(), json)
}

fn print_stats(stats: &[volume_index::IndexStats], json: bool) -> Result<()> {
    if json {
        let rows: Vec<serde_json::Value> = stats
            .iter()
            .map(|s| {
                serde_json::json!({
                    "drive": s.drive,
                    "records": s.records,
                    "built_at": s.built_at,
                    "build_duration": s.build_duration,
                    "usn_journal_id": s.usn_journal_id,
                    "last_usn": s.last_usn,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if stats.is_empty() {
        println!("{}", style("No volume indexes loaded.").yellow());
        return Ok(());
    }
    println!("{}", style("Volumes:").green());
    for s in stats {
        println!(
            "  {}: {:>9} records | built {} | {:.2}s | journal {:#x} @ usn {}",
            s.drive,
            s.records,
            if s.built_at > 0.0 {
                format!("{:.0}", s.built_at)
            } else {
                "-".into()
            },
            s.build_duration,
            s.usn_journal_id,
            s.last_usn,
        );
    }
    Ok(())
}

fn cmd_config(mut cfg: AppConfig, config_path: PathBuf, sub: ConfigCmd) -> Result<()> {
    match sub {
        ConfigCmd::Show => {
            println!("{}", style("Config path:").green());
            println!("  {}", config_path.display());
            println!("{}", style("Config:").green());
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        ConfigCmd::AllowPath { path } => {
            let mut paths = if cfg.c_scan_paths.initialized {
                cfg.c_scan_paths.paths.clone()
            } else {
                config::default_c_paths()
            };
            if !paths.iter().any(|e| e.path.eq_ignore_ascii_case(&path)) {
                paths.push(config::AllowEntry {
                    path: path.clone(),
                    enabled: true,
                });
            }
            cfg.c_scan_paths = config::CScanPaths {
                initialized: true,
                paths,
            };
            cfg.save(&config_path)?;
            println!("{} {path}", style("Allowlisted").green());
        }
        ConfigCmd::SetEverything { enabled } => {
            cfg.everything_mode = enabled;
            cfg.save(&config_path)?;
            println!(
                "{} {}",
                style("Everything mode:").green(),
                if enabled { "on" } else { "off" }
            );
        }
    }
    Ok(())
}
