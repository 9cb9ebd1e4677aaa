use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use nightfall_core::parse_bool_flag;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const ENV_LOG_LEVEL: &str = "NIGHTFALL_LOG_LEVEL";
const ENV_LOG_DIR: &str = "NIGHTFALL_LOG_DIR";
const ENV_LOG_STDOUT: &str = "NIGHTFALL_LOG_STDOUT";
const DEFAULT_LOG_DIR: &str = ".nightfall/logs";

pub struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

/// Fans log lines out to the log file and, when enabled, stderr. Stdout is
/// left to the status printer.
struct MultiWriter {
    stderr_enabled: bool,
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

pub fn init_logging(log_dir: &str, log_stderr: bool) -> Option<LogGuard> {
    let level = env::var(ENV_LOG_LEVEL)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stderr_enabled: log_stderr,
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr_enabled {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr_enabled {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("nightfall-console.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}

/// Flag, then `NIGHTFALL_LOG_DIR`, then the default. `-` disables the file.
pub fn resolve_log_dir(flag: &str) -> String {
    let chosen = if !flag.trim().is_empty() {
        flag.to_string()
    } else {
        env::var(ENV_LOG_DIR)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())
    };
    if chosen.trim() == "-" {
        String::new()
    } else {
        chosen
    }
}

pub fn resolve_log_stderr() -> bool {
    env::var(ENV_LOG_STDOUT)
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}
