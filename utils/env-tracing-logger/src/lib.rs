//! Initialize a global tracing subscriber configured by `RUST_LOG`.

use time::{format_description::well_known::Iso8601, UtcOffset};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

struct Guard {}

impl Drop for Guard {
    fn drop(&mut self) {}
}

/// Where log output goes and which events pass when `RUST_LOG` is unset.
#[derive(Debug, Clone)]
pub struct LogConfig<'a> {
    /// Filter directive used when `RUST_LOG` is not set, e.g. `"info"`.
    pub default_directive: &'a str,
    pub file: Option<&'a std::path::Path>,
    pub console: bool,
}

impl Default for LogConfig<'_> {
    fn default() -> Self {
        Self {
            default_directive: "info",
            file: None,
            console: true,
        }
    }
}

/// Log to the console at `default_directive` unless `RUST_LOG` says otherwise.
pub fn init(default_directive: &str) -> Result<impl Drop> {
    initiate_logging(&LogConfig {
        default_directive,
        ..Default::default()
    })
}

fn env_filter(default_directive: &str) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => EnvFilter::new(var),
        _ => EnvFilter::new(default_directive),
    }
}

/// Start logging to file and console, both optional.
pub fn initiate_logging(cfg: &LogConfig<'_>) -> Result<impl Drop> {
    // Create a fixed offset time formatter based on the timezone at the
    // time this line of code runs.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = if let Some(path) = cfg.file {
        let file = std::fs::File::create(path)?;
        let file_writer = std::sync::Mutex::new(file);
        Some(
            fmt::layer()
                .with_timer(timer.clone())
                .with_writer(file_writer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let console_layer = if cfg.console {
        let with_ansi = !cfg!(windows);
        Some(
            fmt::layer()
                .with_timer(timer)
                .with_ansi(with_ansi)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter(cfg.default_directive));
    tracing::subscriber::set_global_default(collector)?;

    let log_var = if let Ok(var) = std::env::var("RUST_LOG") {
        format!(" with RUST_LOG=\"{}\".", var)
    } else {
        format!(" with default filter \"{}\".", cfg.default_directive)
    };

    if let Some(path) = cfg.file {
        tracing::debug!("Logging initiated to file \"{}\"{log_var}", path.display());
    }

    if cfg.console {
        tracing::debug!("Logging initiated to console{log_var}");
    }

    Ok(Guard {})
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_logging() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let guard = initiate_logging(&LogConfig {
            default_directive: "debug",
            file: Some(&path),
            console: false,
        })
        .unwrap();
        tracing::error!("written to file");
        drop(guard);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("written to file"), "{contents}");
        // only one global subscriber per process
        assert!(init("info").is_err());
    }
}
