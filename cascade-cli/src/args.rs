use std::path::PathBuf;

use cascade_engine::CascadeConfig;
use clap::Parser;
use url::Url;

use crate::error::CliError;

#[derive(Debug, Parser)]
#[command(
    name = "cascade",
    version,
    about = "Play an HLS stream through the adaptive fragment pipeline"
)]
pub struct Args {
    /// Multivariant or media playlist URL
    pub url: Url,

    /// Directory the remuxed fMP4 streams are written to
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// JSON session configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds to buffer ahead of the playhead
    #[arg(long)]
    pub max_buffer: Option<f64>,

    /// Start position in seconds
    #[arg(long)]
    pub start: Option<f64>,

    /// Per-buffer memory quota in MiB
    #[arg(long, default_value_t = 256)]
    pub quota_mb: usize,

    /// Load as fast as possible instead of following the playhead in real time
    #[arg(long)]
    pub no_realtime: bool,

    /// Log filter, e.g. `info` or `cascade_engine=debug`
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Also write daily-rotated logs into this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Args {
    /// Session configuration from `--config` with command-line overrides applied.
    pub fn session_config(&self) -> Result<CascadeConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)
                    .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))?
            }
            None => CascadeConfig::default(),
        };
        if let Some(seconds) = self.max_buffer {
            if seconds.is_nan() || seconds <= 0.0 {
                return Err(CliError::Config(format!(
                    "--max-buffer must be positive, got {seconds}"
                )));
            }
            config.buffer.max_buffer_length = seconds;
        }
        if self.start.is_some() {
            config.fragment.start_position = self.start;
        }
        Ok(config)
    }
}
