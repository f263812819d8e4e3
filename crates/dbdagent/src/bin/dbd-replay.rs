use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dbdagent::agent::replay;
use dbdagent::common::setup::setup_logging;
use jobres::protocol::{PROTOCOL_VERSION, format_version};

#[derive(Parser)]
#[command(author, version, about = "Inspect and convert saved accounting messages")]
struct Opts {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the messages stored in a replay file
    Show(ShowOpts),
    /// Rewrite a replay file in the current protocol version
    Upgrade(UpgradeOpts),
}

#[derive(clap::Args)]
struct ShowOpts {
    /// Path to the replay file
    file: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputMode::Text)]
    output_mode: OutputMode,
}

#[derive(clap::Args)]
struct UpgradeOpts {
    /// Path to the replay file
    file: PathBuf,

    /// Write the converted file here instead of replacing the input
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputMode {
    Text,
    Json,
}

fn show(opts: ShowOpts) -> anyhow::Result<()> {
    let (version, entries) = replay::entries(&opts.file)
        .with_context(|| format!("Cannot open replay file {}", opts.file.display()))?;
    if let OutputMode::Text = opts.output_mode {
        println!(
            "Replay file {}, protocol version {}",
            opts.file.display(),
            format_version(version)
        );
    }
    for entry in &entries {
        match opts.output_mode {
            OutputMode::Text => println!("{}", entry.describe()),
            OutputMode::Json => println!("{}", serde_json::to_string(&entry.to_json())?),
        }
    }
    Ok(())
}

fn upgrade(opts: UpgradeOpts) -> anyhow::Result<()> {
    let output: &Path = opts.output.as_deref().unwrap_or(&opts.file);
    let summary = replay::upgrade(&opts.file, output, PROTOCOL_VERSION)
        .with_context(|| format!("Cannot upgrade replay file {}", opts.file.display()))?;
    println!(
        "Converted {} messages from protocol version {} to {} ({} dropped)",
        summary.stored,
        format_version(summary.from_version),
        format_version(PROTOCOL_VERSION),
        summary.dropped
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    setup_logging(opts.verbose);
    match opts.command {
        Command::Show(opts) => show(opts),
        Command::Upgrade(opts) => upgrade(opts),
    }
}
