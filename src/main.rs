use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spillmon::agent::Agent;
use spillmon::config::{ChannelAlias, ChannelValue, Config, Override};
use tracing_subscriber::{fmt, EnvFilter};

/// Real-time spill structure monitor for trigger event streams.
#[derive(Parser)]
#[command(name = "spillmon", about)]
struct Cli {
    /// Path to the YAML configuration file. Built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Acquisition server address, "host:port".
    #[arg(long)]
    server: Option<String>,

    /// Replay a recorded frame file instead of connecting.
    #[arg(long, conflicts_with = "server")]
    replay: Option<PathBuf>,

    /// Publish snapshots to TCP subscribers.
    #[arg(long)]
    json: bool,

    /// Publish port (1024..=65535). Implies --json.
    #[arg(long)]
    port: Option<u16>,

    /// Capture one spill to the dump file, then exit.
    #[arg(long)]
    json_dump: bool,

    /// Rename a channel, "N=NAME". Repeatable.
    #[arg(long = "alias", value_name = "N=NAME")]
    aliases: Vec<ChannelAlias>,

    /// Micro histogram bins for all channels, or one with "N=BINS". Repeatable.
    #[arg(long, value_name = "[N=]BINS")]
    nbins_micro: Vec<ChannelValue<usize>>,

    /// Longest micro interval in clock ticks, "[N=]TICKS". Repeatable.
    #[arg(long, value_name = "[N=]TICKS")]
    max_range_micro: Vec<ChannelValue<u32>>,

    /// Macro bin width in seconds, "[N=]SECONDS". Repeatable.
    #[arg(long, value_name = "[N=]SECONDS")]
    bin_macro: Vec<ChannelValue<f64>>,

    /// Print a per-spill scaler table.
    #[arg(long)]
    monitor: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

impl Cli {
    /// Applies command-line settings on top of the file configuration.
    fn apply(&self, cfg: &mut Config) {
        if let Some(level) = &self.log_level {
            cfg.log_level.clone_from(level);
        }
        if let Some(server) = &self.server {
            cfg.source.address.clone_from(server);
            cfg.source.replay = None;
        }
        if let Some(replay) = &self.replay {
            cfg.source.replay = Some(replay.clone());
        }
        if self.json {
            cfg.publish.enabled = true;
        }
        if let Some(port) = self.port {
            cfg.publish.enabled = true;
            cfg.publish.port = port;
        }
        if self.json_dump {
            cfg.publish.dump = true;
        }
        if self.monitor {
            cfg.pipeline.monitor = true;
        }

        let overrides = self
            .aliases
            .iter()
            .cloned()
            .map(Override::Alias)
            .chain(self.nbins_micro.iter().copied().map(Override::MicroBins))
            .chain(self.max_range_micro.iter().copied().map(Override::MicroRange))
            .chain(self.bin_macro.iter().copied().map(Override::MacroBinWidth));
        for over in overrides {
            cfg.apply(&over);
        }
    }
}

/// Build-time version info, injected via the environment at compile time.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("spillmon {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cli.apply(&mut cfg);

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    cfg.validate().context("invalid configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting spillmon",
    );

    Agent::new(cfg)?.run()?;

    tracing::info!("spillmon stopped");

    Ok(())
}
