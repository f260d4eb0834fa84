use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Server,
    Worker,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Server => "server",
            ProcessKind::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: Option<String>,
    pub initialized_at: DateTime<Utc>,
}

/// Installs the global tracing subscriber: an env-filtered console layer
/// (`QUARRY_LOG`, default `info`) plus an optional JSON file layer when a
/// logs directory is given. The returned guard must be held for the
/// process lifetime so buffered file output flushes.
pub fn init_logging(
    process: ProcessKind,
    logs_dir: Option<PathBuf>,
) -> anyhow::Result<(Option<WorkerGuard>, LoggingInitInfo)> {
    let filter = EnvFilter::try_from_env("QUARRY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer().with_target(false);

    let mut guard = None;
    let file_layer = match &logs_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("quarry-{}.log", process.as_str()));
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?;

    Ok((
        guard,
        LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: logs_dir.map(|d| d.display().to_string()),
            initialized_at: Utc::now(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_kinds_name_themselves() {
        assert_eq!(ProcessKind::Server.as_str(), "server");
        assert_eq!(ProcessKind::Worker.as_str(), "worker");
    }
}
