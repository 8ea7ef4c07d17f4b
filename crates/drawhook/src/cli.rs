use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "drawhook",
    author,
    version,
    about = "Inspect drawhook toggle-group configs and replay recorded host traces"
)]
pub struct Cli {
    /// Toggle-group config; defaults to `drawhook.toml` in the config directory.
    #[arg(long, global = true, value_name = "PATH", env = "DRAWHOOK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a JSON event trace and report what was injected per frame.
    Replay(ReplayArgs),
    /// Parse and validate a config, then summarise its groups.
    Check,
    /// Print the resolved config and trace directories.
    Where,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Trace file. Relative names not found in the working directory are
    /// looked up in the trace directory.
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Emit the report as JSON instead of one line per frame.
    #[arg(long)]
    pub json: bool,

    /// Override the back-buffer resolution recorded in the trace (e.g. `2560x1440`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub back_buffer: Option<(u32, u32)>,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let trimmed = value.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{trimmed}'; expected WIDTHxHEIGHT"))?;
    let parse = |raw: &str| {
        raw.trim()
            .parse::<u32>()
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| format!("invalid size '{trimmed}'; dimensions must be positive integers"))
    };
    Ok((parse(width)?, parse(height)?))
}
