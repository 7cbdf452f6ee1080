//! Harvester CLI
//!
//! Thin entrypoint for scheduled runs:
//! - `run`: one incremental synchronization run
//! - `parse`: inspect a resource list without touching any server
//! - `watermark`: show or reset the committed watermark

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use harvester_manifest::{epoch, ResourceListParser};
use harvester_sync::{format_watermark, parse_watermark, Harvester, HarvesterConfig, SyncReport};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harvester")]
#[command(author, version, about = "Incremental entity harvester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synchronization: fetch, plan, register, reconcile, commit.
    Run {
        /// Harvester configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Plan and log everything, write nothing, keep the watermark
        #[arg(long)]
        dry_run: bool,

        /// Log every planned entity
        #[arg(short, long)]
        verbose: bool,

        /// Print the run report as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Parse a resource list file and print a JSON summary of its graph.
    Parse {
        /// Resource list XML
        input: PathBuf,

        /// Local space the identifiers are rewritten into
        #[arg(long)]
        space: String,

        /// Watermark (RFC 3339); entities at or before it count as unmodified
        #[arg(long)]
        since: Option<String>,
    },

    /// Inspect or reset the committed watermark.
    Watermark {
        #[command(subcommand)]
        command: WatermarkCommands,
    },
}

#[derive(Subcommand)]
enum WatermarkCommands {
    /// Print the committed watermark
    Show {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Delete the watermark file; the next run is a full resync
    Reset {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    init_tracing(verbose);

    match cli.command {
        Commands::Run {
            config,
            dry_run,
            verbose,
            json,
        } => cmd_run(&config, dry_run, verbose, json).await,
        Commands::Parse {
            input,
            space,
            since,
        } => cmd_parse(&input, &space, since.as_deref()),
        Commands::Watermark { command } => match command {
            WatermarkCommands::Show { config } => cmd_watermark_show(&config),
            WatermarkCommands::Reset { config } => cmd_watermark_reset(&config),
        },
    }
}

fn load_config(path: &Path) -> Result<HarvesterConfig> {
    HarvesterConfig::load(path).with_context(|| format!("loading configuration {}", path.display()))
}

async fn cmd_run(config_path: &Path, dry_run: bool, verbose: bool, json: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.harvester.dry_run |= dry_run;
    config.harvester.verbose |= verbose;

    let harvester = Harvester::from_config(config).context("setting up collaborators")?;
    let report = harvester.run().await.context("harvester run failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    let header = if report.dry_run {
        "Dry run complete".yellow().bold()
    } else {
        "Run complete".green().bold()
    };
    println!("{header} ({})", report.space);
    println!(
        "  window:     {} .. {}",
        format_watermark(report.window_start),
        format_watermark(report.window_end)
    );
    println!(
        "  entities:   {} registered, {} updated",
        report.entity_registrations, report.entity_updates
    );
    println!(
        "  data sets:  {} added, {} updated, {} failed, {} black-listed",
        report.content.registered.len(),
        report.content.updated.len(),
        report.content.failed.len(),
        report.black_listed
    );
    println!(
        "  attachments: {} added, {} updated, {} deleted, {} holders failed",
        report.attachments.added,
        report.attachments.updated,
        report.attachments.deleted,
        report.attachments.failed.len()
    );
    println!(
        "  relations:  {} containers registered, {} updated, {} skipped",
        report.container_registrations,
        report.relationship_updates,
        report.relationship_skipped.len()
    );
    for (code, reason) in &report.content.failed {
        println!("  {} {code}: {reason}", "✗".red());
    }
    for (holder, reason) in &report.attachments.failed {
        println!("  {} {holder}: {reason}", "✗".red());
    }
    match report.committed_watermark {
        Some(ts) => println!("  watermark:  {}", format_watermark(ts).cyan()),
        None => println!("  watermark:  {}", "unchanged".dimmed()),
    }
}

fn cmd_parse(input: &Path, space: &str, since: Option<&str>) -> Result<()> {
    let watermark = match since {
        Some(value) => parse_watermark(value)
            .with_context(|| format!("`{value}` is not a valid timestamp"))?,
        None => epoch(),
    };
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let list = ResourceListParser::new(space, watermark)
        .parse_bytes(&bytes)
        .with_context(|| format!("parsing {}", input.display()))?;
    println!("{}", serde_json::to_string_pretty(&list.summary())?);
    Ok(())
}

fn cmd_watermark_show(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let checkpoint = harvester_sync::Checkpoint::new(&config.harvester.last_sync_timestamp_file);
    let watermark = checkpoint.load()?;
    if watermark == epoch() {
        println!("{} (no successful run recorded)", format_watermark(watermark).dimmed());
    } else {
        println!("{}", format_watermark(watermark));
    }
    Ok(())
}

fn cmd_watermark_reset(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let checkpoint = harvester_sync::Checkpoint::new(&config.harvester.last_sync_timestamp_file);
    if checkpoint.reset()? {
        println!("{} watermark removed, next run is a full resync", "✓".green());
    } else {
        println!("no watermark file at {}", checkpoint.path().display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from(["harvester", "run", "-c", "h.toml", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Run {
                config,
                dry_run,
                verbose,
                json,
            } => {
                assert_eq!(config, PathBuf::from("h.toml"));
                assert!(dry_run);
                assert!(!verbose);
                assert!(!json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_prints_summary_of_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.xml");
        std::fs::write(
            &path,
            r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"></urlset>"#,
        )
        .unwrap();
        cmd_parse(&path, "DST", Some("2016-06-30T00:00:00Z")).unwrap();
        assert!(cmd_parse(&path, "DST", Some("yesterday")).is_err());
    }
}
