//! devrack: runit-based supervision for a local development installation.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads `devrack.toml`, and drives the supervisor on a blocking
//! thread while printing its progress.

#[cfg(not(unix))]
compile_error!("devrack drives runit and only supports Unix hosts");

mod config;
mod control;
mod daemon;
mod events;
mod layout;
mod output;
mod render;
mod runner;
mod scripts;
mod service;
mod shortcuts;
mod status;
mod tail;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::control::SvControl;
use crate::daemon::{Runsvdir, CONTROL_BINARY, DAEMON_BINARY};
use crate::events::Event;
use crate::layout::Layout;
use crate::output::{apply_color, format_tool_message, sanitize_text};
use crate::render::Renderer;
use crate::runner::{LifecycleError, Supervisor};
use crate::status::StatusError;
use crate::tail::Tail;

type RunitSupervisor = Supervisor<SvControl, Runsvdir>;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Supervise development services with runit",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to devrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log debug diagnostics to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write the supervision tree and start runsvdir.
    Reconfigure,
    /// Start services (everything when no names are given).
    Start { names: Vec<String> },
    /// Stop services (everything when no names are given).
    Stop { names: Vec<String> },
    /// Stop, then start services.
    Restart { names: Vec<String> },
    /// Show service status.
    Status {
        names: Vec<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Follow service logs.
    Tail {
        names: Vec<String>,
        /// Strip ANSI colors from log lines.
        #[arg(long)]
        no_color: bool,
    },
    /// Print the effective name shortcuts.
    Shortcuts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = config::load_config(&config_path)?;
    let layout = Layout::new(config.root(&config_path)?);
    let use_symbols = std::io::stdout().is_terminal();

    let ok = match cli.command {
        Commands::Reconfigure => {
            reconfigure(&config, &layout, use_symbols)?;
            run_lifecycle(&config, layout, use_symbols, |supervisor| {
                supervisor.bootstrap().map(|()| true)
            })
            .await?
        }
        Commands::Start { names } => {
            run_lifecycle(&config, layout, use_symbols, move |supervisor| {
                supervisor.start(&names)
            })
            .await?
        }
        Commands::Stop { names } => {
            run_lifecycle(&config, layout, use_symbols, move |supervisor| {
                supervisor.stop(&names)
            })
            .await?
        }
        Commands::Restart { names } => {
            run_lifecycle(&config, layout, use_symbols, move |supervisor| {
                supervisor.restart(&names)
            })
            .await?
        }
        Commands::Status { names, json } => {
            let (supervisor, _events) = build_supervisor(&config, layout)?;
            print_status(&supervisor, &names, json, use_symbols)?
        }
        Commands::Tail { names, no_color } => {
            let (supervisor, _events) = build_supervisor(&config, layout)?;
            follow_logs(&supervisor, &names, no_color, use_symbols).await?
        }
        Commands::Shortcuts => {
            let table = config.shortcut_table();
            let width = table.iter().map(|(alias, _)| alias.len()).max().unwrap_or(0);
            for (alias, pattern) in table.iter() {
                println!("{alias:<width$}  {pattern}");
            }
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_supervisor(
    config: &Config,
    layout: Layout,
) -> Result<(RunitSupervisor, mpsc::Receiver<Event>)> {
    let control = SvControl::new(daemon::locate(CONTROL_BINARY)?);
    let daemon = Runsvdir::new(
        daemon::locate(DAEMON_BINARY)?,
        layout.root(),
        layout.services_dir(),
    );
    let (event_tx, event_rx) = mpsc::channel(256);
    let supervisor = Supervisor::new(
        layout,
        config.shortcut_table(),
        config.supervisor_settings(),
        control,
        daemon,
        event_tx,
    )
    .with_ready_messages(&config.service_descriptors());
    Ok((supervisor, event_rx))
}

fn reconfigure(config: &Config, layout: &Layout, use_symbols: bool) -> Result<()> {
    let report = Renderer::new(layout, config.log_rotation())
        .render(&config.service_descriptors())
        .with_context(|| format!("failed to render {}", layout.sv_dir().display()))?;
    let message = if report.is_unchanged() {
        "supervision tree is up to date".to_string()
    } else {
        format!(
            "wrote {} files, linked {}, pruned {}",
            report.written.len(),
            report.linked.len(),
            report.pruned.len()
        )
    };
    println!("{}", format_tool_message(&message, use_symbols));
    Ok(())
}

/// Runs a lifecycle operation on a blocking thread, printing events as the
/// supervisor emits them.
async fn run_lifecycle<F>(config: &Config, layout: Layout, use_symbols: bool, op: F) -> Result<bool>
where
    F: FnOnce(&RunitSupervisor) -> Result<bool, LifecycleError> + Send + 'static,
{
    let (supervisor, mut events) = build_supervisor(config, layout)?;
    let mut task = tokio::task::spawn_blocking(move || op(&supervisor));
    let result = loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event, use_symbols),
            joined = &mut task => break joined.context("supervisor thread panicked")?,
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event, use_symbols);
    }
    match result {
        Ok(ok) => Ok(ok),
        Err(err @ LifecycleError::UnknownService { .. }) => {
            eprintln!("{}", format_tool_message(&err.to_string(), use_symbols));
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

fn print_event(event: &Event, use_symbols: bool) {
    let message = format_tool_message(&output::describe_event(event), use_symbols);
    println!("{}", apply_color(&message, output::event_color(event)));
}

fn print_status(
    supervisor: &RunitSupervisor,
    names: &[String],
    json: bool,
    use_symbols: bool,
) -> Result<bool> {
    let statuses = match supervisor.status(names) {
        Ok(statuses) => statuses,
        Err(LifecycleError::Status(err @ StatusError::ServiceNotFound { .. })) => {
            eprintln!("{}", format_tool_message(&err.to_string(), use_symbols));
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };
    let now = SystemTime::now();
    if json {
        println!("{}", output::status_json(&statuses, now)?);
    } else {
        print!("{}", output::render_status_table(&statuses, now, use_symbols));
    }
    Ok(true)
}

async fn follow_logs(
    supervisor: &RunitSupervisor,
    names: &[String],
    no_color: bool,
    use_symbols: bool,
) -> Result<bool> {
    let files = supervisor.log_files(names)?;
    if files.is_empty() {
        println!("{}", format_tool_message("no matching services", use_symbols));
        return Ok(true);
    }
    let mut tail = Tail::follow(files, tail::POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            line = tail.next_line() => match line {
                Some(line) => println!("{}", sanitize_text(&line, no_color)),
                None => break,
            },
            _ = &mut ctrl_c => break,
        }
    }
    Ok(true)
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
