mod logging;
mod operator;
mod status;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nightfall_link::backoff::DEFAULT_BACKOFF_MAX;
use nightfall_link::config::{build_policy, parse_endpoint};
use nightfall_link::{ConfigError, LinkConfig, LinkEvent, LinkHandle, ReconnectPolicy, TelemetryLink};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::logging::{init_logging, resolve_log_dir, resolve_log_stderr};
use crate::operator::{plan, OperatorAction};
use crate::status::render_status_line;

#[derive(Parser, Debug)]
#[command(name = "nightfall-console", about = "Operator console for the Nightfall rover link")]
struct Args {
    /// Device endpoint, `ws://host:port` or bare `host:port`.
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long)]
    reconnect_ms: Option<u64>,
    /// `fixed` or `exponential`.
    #[arg(long, default_value = "")]
    backoff: String,
    #[arg(long)]
    backoff_max_ms: Option<u64>,
    #[arg(long)]
    rate_window_ms: Option<u64>,
    /// `0` keeps autonomy predictions until the device confirms them.
    #[arg(long)]
    prediction_timeout_ms: Option<u64>,
    /// Give up on a connect attempt that has not finished its handshake.
    #[arg(long)]
    connect_timeout_ms: Option<u64>,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Print the full link view as JSON instead of the status line.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&resolve_log_dir(&args.log_dir), resolve_log_stderr());
    let config = resolve_config(&args).context("invalid link configuration")?;
    info!(
        url = %config.url,
        reconnect = config.reconnect.kind(),
        "console_start"
    );

    let rate_window = config.rate_window;
    let link = TelemetryLink::spawn(config);
    let mut events = link.subscribe();
    link.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status_ticker = tokio::time::interval(rate_window);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_line(&link, &line) {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!("stdin_read_error: {err}");
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Ok(event) => report_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("link_events_lagged: {skipped}"),
                Err(RecvError::Closed) => break,
            },
            _ = status_ticker.tick() => {
                let view = link.view();
                if args.json {
                    match serde_json::to_string(&view) {
                        Ok(line) => println!("{line}"),
                        Err(err) => warn!("view_encode_error: {err}"),
                    }
                } else {
                    println!("{}", render_status_line(&view));
                }
            }
            _ = &mut shutdown => {
                info!("console_interrupted");
                break;
            }
        }
    }

    link.dispose().await;
    Ok(())
}

/// Returns false when the operator asked to quit.
fn handle_line(link: &LinkHandle, line: &str) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    let action = match line.parse::<OperatorAction>() {
        Ok(action) => action,
        Err(err) => {
            println!("? {err}");
            return true;
        }
    };
    if action == OperatorAction::Quit {
        return false;
    }
    match plan(&action, &link.view()) {
        Ok(planned) => {
            if let Some(predicted) = planned.prediction {
                link.set_prediction(predicted);
            }
            for command in &planned.commands {
                link.send_command(command);
            }
            if action == OperatorAction::EmergencyStop {
                warn!("operator_estop");
            }
        }
        Err(refusal) => println!("! {refusal}"),
    }
    true
}

fn report_event(event: &LinkEvent) {
    match event {
        LinkEvent::StatusChanged { from, to } => println!("link {from} -> {to}"),
        LinkEvent::Hazard { alert, .. } => {
            let level = if alert.critical { "CRITICAL" } else { "hazard" };
            println!("{level} {}: {}", alert.hazard, alert.msg);
        }
        LinkEvent::DeviceStatus { report, .. } => {
            println!("{} {}: {}", report.role, report.status, report.msg);
        }
        LinkEvent::CommandDropped { record, error } => {
            println!("dropped {}: {error}", record.cmd().unwrap_or(record.command_type()));
        }
        LinkEvent::PredictionExpired { confirmed, .. } => {
            println!("autonomy change not confirmed; device reports auto={confirmed}");
        }
        LinkEvent::TelemetryUpdated { .. } | LinkEvent::PredictionReconciled { .. } => {}
    }
}

/// Environment first, then flags on top.
fn resolve_config(args: &Args) -> Result<LinkConfig, ConfigError> {
    let mut config = LinkConfig::from_env()?;
    if !args.url.trim().is_empty() {
        config.url = parse_endpoint(&args.url)?;
    }

    if args.reconnect_ms.is_some() || args.backoff_max_ms.is_some() || !args.backoff.trim().is_empty() {
        let (interval, max) = match config.reconnect {
            ReconnectPolicy::Fixed(delay) => (delay, DEFAULT_BACKOFF_MAX),
            ReconnectPolicy::Exponential { initial, max } => (initial, max),
        };
        let interval = args.reconnect_ms.map(Duration::from_millis).unwrap_or(interval);
        let max = args.backoff_max_ms.map(Duration::from_millis).unwrap_or(max);
        let kind = if args.backoff.trim().is_empty() {
            config.reconnect.kind()
        } else {
            args.backoff.as_str()
        };
        config.reconnect = build_policy("--backoff", kind, interval, max)?;
    }

    if let Some(window) = args.rate_window_ms {
        if window == 0 {
            return Err(ConfigError::InvalidValue {
                key: "--rate-window-ms",
                value: window.to_string(),
            });
        }
        config.rate_window = Duration::from_millis(window);
    }
    if let Some(timeout) = args.prediction_timeout_ms {
        config.prediction_timeout = (timeout > 0).then(|| Duration::from_millis(timeout));
    }
    if let Some(timeout) = args.connect_timeout_ms {
        if timeout == 0 {
            return Err(ConfigError::InvalidValue {
                key: "--connect-timeout-ms",
                value: timeout.to_string(),
            });
        }
        config.connect_timeout = Duration::from_millis(timeout);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_reconnect_policy() {
        let args = Args::parse_from([
            "nightfall-console",
            "--url",
            "10.0.0.9:8888",
            "--backoff",
            "exponential",
            "--reconnect-ms",
            "500",
            "--prediction-timeout-ms",
            "0",
            "--connect-timeout-ms",
            "1500",
        ]);
        let config = resolve_config(&args).expect("config");
        assert_eq!(config.url.as_str(), "ws://10.0.0.9:8888/");
        assert_eq!(config.reconnect.kind(), "exponential");
        assert_eq!(config.reconnect.delay_for(1), Duration::from_millis(500));
        assert_eq!(config.prediction_timeout, None);
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn zero_rate_window_flag_is_rejected() {
        let args = Args::parse_from(["nightfall-console", "--rate-window-ms", "0"]);
        assert!(matches!(
            resolve_config(&args),
            Err(ConfigError::InvalidValue { key: "--rate-window-ms", .. })
        ));
    }

    #[test]
    fn zero_connect_timeout_flag_is_rejected() {
        let args = Args::parse_from(["nightfall-console", "--connect-timeout-ms", "0"]);
        assert!(matches!(
            resolve_config(&args),
            Err(ConfigError::InvalidValue { key: "--connect-timeout-ms", .. })
        ));
    }
}
