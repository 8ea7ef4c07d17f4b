use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use drawhook::{parse_trace, replay, FrameReport, ReplayReport};
use groupconfig::HookConfig;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, ReplayArgs};
use crate::paths::AppPaths;

pub fn run(cli: Cli) -> Result<()> {
    initialise_tracing();

    let paths = AppPaths::discover()?;
    tracing::debug!(
        config = %paths.config_dir().display(),
        data = %paths.data_dir().display(),
        "resolved drawhook paths"
    );

    match cli.command {
        Command::Replay(args) => {
            let config = load_config(cli.config.as_deref(), &paths)?;
            run_replay(config, &args, &paths)
        }
        Command::Check => {
            let config = load_config(cli.config.as_deref(), &paths)?;
            print_summary(&config);
            Ok(())
        }
        Command::Where => {
            println!("config dir: {}", paths.config_dir().display());
            println!("config file: {}", paths.config_file().display());
            println!("trace dir: {}", paths.trace_dir().display());
            Ok(())
        }
    }
}

fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// An explicit path must exist; the default config file is optional.
fn load_config(explicit: Option<&Path>, paths: &AppPaths) -> Result<HookConfig> {
    if let Some(path) = explicit {
        return HookConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }

    let path = paths.config_file();
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found; running without groups");
        return Ok(HookConfig::default());
    }
    HookConfig::load(&path).with_context(|| format!("failed to load config {}", path.display()))
}

fn run_replay(config: HookConfig, args: &ReplayArgs, paths: &AppPaths) -> Result<()> {
    let path = paths.locate_trace(&args.trace);
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("failed to read trace {}", path.display()))?;
    let mut trace =
        parse_trace(&contents).with_context(|| format!("invalid trace {}", path.display()))?;
    if let Some(size) = args.back_buffer {
        trace.back_buffer = size;
    }

    tracing::info!(
        trace = %path.display(),
        events = trace.events.len(),
        groups = config.groups.len(),
        "replaying trace"
    );
    let report = replay(config, &trace)?;

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("failed to encode report")?;
        println!("{json}");
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &ReplayReport) {
    for frame in &report.frames {
        println!("{}", frame_line(frame));
    }
    println!(
        "{} frame(s), {} effect pass(es)",
        report.frames.len(),
        report.total_effects()
    );
}

fn frame_line(frame: &FrameReport) -> String {
    let mut line = format!(
        "frame {}: {} draw(s), {} effect(s), {} binding(s), {} constant set(s), {} preview(s)",
        frame.frame,
        frame.host_draws,
        frame.effects,
        frame.bindings,
        frame.constants,
        frame.previews
    );
    if !frame.rendered.is_empty() {
        line.push_str(&format!(" [rendered: {}]", frame.rendered.join(", ")));
    }
    line
}

fn print_summary(config: &HookConfig) {
    println!(
        "config ok: {} group(s), capture {:?}, bindings {:?}",
        config.groups.len(),
        config.settings.constant_capture,
        config.settings.binding_mode
    );
    for group in &config.groups {
        println!(
            "  {} active={} pixel={} vertex={} techniques=[{}] invocation={:?} match={:?}",
            group.label(),
            group.active,
            group.pixel_shaders.len(),
            group.vertex_shaders.len(),
            group.techniques.join(", "),
            group.invocation,
            group.match_mode
        );
        if !group.has_side_effects() {
            tracing::warn!(group = %group.label(), "group only takes part in edit previews");
        }
    }
}
