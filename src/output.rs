//! Terminal rendering of controller results.
//!
//! This module turns events, service statuses and followed log lines into the
//! text printed by the CLI. It also handles text sanitization for display.

use std::time::{Duration, SystemTime};

use serde::Serialize;
use strip_ansi_escapes::strip;

use crate::events::Event;
use crate::status::ServiceStatus;

/// Prefixes a message that comes from devrack itself rather than a service.
pub fn format_tool_message(text: &str, use_symbols: bool) -> String {
    if use_symbols {
        format!("◆ devrack: {}", text)
    } else {
        format!("[devrack] {}", text)
    }
}

pub fn apply_color(text: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        _ => "0",
    };
    if code == "0" {
        text.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, text)
    }
}

/// One-line description of a controller event.
pub fn describe_event(event: &Event) -> String {
    match event {
        Event::DaemonStarted { pid } => format!("started runsvdir (pid {pid})"),
        Event::DaemonUnloaded => "unloaded runsvdir".to_string(),
        Event::Starting { services } => format!("starting {}", services.join(", ")),
        Event::Stopping { services } => format!("stopping {}", services.join(", ")),
        Event::Retrying {
            services,
            attempt,
            max,
        } => format!(
            "{} did not stop (attempt {attempt}/{max}), retrying",
            services.join(", ")
        ),
        Event::ControlFailed {
            verb,
            services,
            stderr,
        } => {
            let mut message = format!("sv {verb} failed for {}", services.join(", "));
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(stderr);
            }
            message
        }
        Event::Ready { service, message } => format!("{service}: {message}"),
    }
}

pub fn event_color(event: &Event) -> Option<&'static str> {
    match event {
        Event::Retrying { .. } => Some("yellow"),
        Event::ControlFailed { .. } => Some("red"),
        Event::Ready { .. } => Some("green"),
        _ => None,
    }
}

/// Compact uptime such as `2d 3h`, `4m 10s` or `42s`.
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (days, hours, minutes, seconds) = (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Aligned status table: name, label, pid and uptime per service.
pub fn render_status_table(statuses: &[ServiceStatus], now: SystemTime, color: bool) -> String {
    let name_width = statuses.iter().map(|status| status.name.len()).max().unwrap_or(0);
    let label_width = statuses
        .iter()
        .map(|status| status.label().len())
        .max()
        .unwrap_or(0);
    let mut table = String::new();
    for status in statuses {
        let label = format!("{:<label_width$}", status.label());
        let label = if color {
            apply_color(&label, Some(label_color(status)))
        } else {
            label
        };
        let pid = if status.up {
            status.pid.to_string()
        } else {
            "-".to_string()
        };
        table.push_str(&format!(
            "{:<name_width$}  {}  {:>7}  {}\n",
            status.name,
            label,
            pid,
            format_uptime(status.elapsed(now)),
        ));
    }
    table
}

fn label_color(status: &ServiceStatus) -> &'static str {
    match (status.up, status.want_up) {
        (true, _) => "green",
        (false, true) => "yellow",
        (false, false) => "gray",
    }
}

#[derive(Serialize)]
struct StatusView<'a> {
    #[serde(flatten)]
    status: &'a ServiceStatus,
    label: &'static str,
    uptime_secs: u64,
}

/// Statuses as a pretty JSON array.
pub fn status_json(statuses: &[ServiceStatus], now: SystemTime) -> serde_json::Result<String> {
    let views: Vec<StatusView<'_>> = statuses
        .iter()
        .map(|status| StatusView {
            status,
            label: status.label(),
            uptime_secs: status.elapsed(now).as_secs(),
        })
        .collect();
    serde_json::to_string_pretty(&views)
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
