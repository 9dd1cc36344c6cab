mod inspect;

use anyhow::{Result, bail};
use console::style;

use crate::config::RuntimeConfig;
use crate::core::terminal::{GuideSection, print_error};
use crate::logging;
use inspect::Inspector;

const DEFAULT_LIST_LIMIT: usize = 20;

fn print_help() {
    GuideSection::new("Inspect")
        .command("status", "List automation apps and what they are doing")
        .command("runs <app>", "Show recent runs of an app")
        .command("activity <app>", "Show the activity timeline of an app")
        .command("pending", "List escalations waiting for an answer")
        .print();

    GuideSection::new("Maintenance")
        .command("prune", "Delete run history past the retention window")
        .command("help", "Show this message")
        .print();

    GuideSection::new("Options")
        .text("--limit, -n <N>   Rows to show for runs/activity (default 20)")
        .text("--days <N>        Retention window for prune (default: runtime.toml)")
        .text("--verbose, -v     Print runtime logs")
        .blank()
        .hint("automata runs daily-digest --limit 5", "")
        .hint("AUTOMATA_DATA_DIR=/srv/automata automata status", "")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("automata").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandArgs {
    pub positional: Vec<String>,
    pub limit: Option<usize>,
    pub days: Option<u32>,
    pub verbose: bool,
}

fn flag_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T> {
    let Some(raw) = args.get(i + 1) else {
        bail!("{} expects a value", flag);
    };
    match raw.parse() {
        Ok(value) => Ok(value),
        Err(_) => bail!("{} expects a number, got '{}'", flag, raw),
    }
}

pub(crate) fn parse_command_args(args: &[String], start: usize) -> Result<CommandArgs> {
    let mut parsed = CommandArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--limit" | "-n" => {
                parsed.limit = Some(flag_value(args, i, "--limit")?);
                i += 2;
            }
            "--days" => {
                parsed.days = Some(flag_value(args, i, "--days")?);
                i += 2;
            }
            "--verbose" | "-v" => {
                parsed.verbose = true;
                i += 1;
            }
            other => {
                parsed.positional.push(other.to_string());
                i += 1;
            }
        }
    }
    Ok(parsed)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    run_with_args(&args).await
}

pub async fn run_with_args(args: &[String]) -> Result<()> {
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }
    if !matches!(cmd, "status" | "runs" | "activity" | "pending" | "prune") {
        print_error(&format!("Unknown command '{}'", cmd));
        print_help();
        return Ok(());
    }

    let parsed = parse_command_args(args, 2)?;
    let config = RuntimeConfig::load()?;
    let level = if parsed.verbose {
        config.tracing_level()
    } else {
        tracing::Level::WARN
    };
    logging::init_logging(level, false);

    let inspector = Inspector::open(&config)?;
    let limit = parsed.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match cmd {
        "status" => inspector.status().await,
        "runs" | "activity" => {
            let Some(app_id) = parsed.positional.first() else {
                print_error(&format!("Usage: automata {} <app> [--limit N]", cmd));
                return Ok(());
            };
            if cmd == "runs" {
                inspector.runs(app_id, limit).await
            } else {
                inspector.activity(app_id, limit).await
            }
        }
        "pending" => inspector.pending().await,
        _ => {
            inspector
                .prune(parsed.days.unwrap_or(config.retention_days))
                .await
        }
    }
}
