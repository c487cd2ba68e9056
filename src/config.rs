//! Application settings loaded from a TOML file and `ACQ_*` environment
//! overrides.
//!
//! These are host-level knobs (buffer sizing, shutdown patience, data
//! directory), distinct from the per-stream acquisition configuration in
//! [`crate::properties`], which travels through
//! [`apply_configuration`](crate::runtime::Runtime::apply_configuration).

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Tuning for the capture pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionSettings {
    /// Capacity of each stream's packet staging buffer, in frames. The
    /// capture task applies backpressure once this many frames are staged
    /// and unretrieved; frames are never dropped.
    #[serde(default = "default_packet_buffer_frames")]
    pub packet_buffer_frames: usize,

    /// How long `stop()` waits for a stream to finish its frame budget
    /// before escalating to cancellation.
    #[serde(with = "humantime_serde", default = "default_stop_timeout")]
    pub stop_timeout: Duration,

    /// Write a JSON manifest (session id, host, start time) next to each
    /// stream's output.
    #[serde(default)]
    pub write_manifest: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            packet_buffer_frames: default_packet_buffer_frames(),
            stop_timeout: default_stop_timeout(),
            write_manifest: false,
        }
    }
}

/// Top-level application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Default directory for relative output uris.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Log filter used when `RUST_LOG` is not set, e.g. `"info"` or
    /// `"rust_acq=debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Capture pipeline tuning.
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            log_level: default_log_level(),
            acquisition: AcquisitionSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus `ACQ_*` environment
    /// variables. All fields have defaults, so `Settings::new(None)` always
    /// succeeds on a clean environment.
    pub fn new(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("acquire").required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("ACQ").separator("__"));
        builder.build()?.try_deserialize()
    }
}

fn default_packet_buffer_frames() -> usize {
    1024
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("rust_acq"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let s = Settings::default();
        assert_eq!(s.acquisition.packet_buffer_frames, 1024);
        assert_eq!(s.acquisition.stop_timeout, Duration::from_secs(30));
        assert!(!s.acquisition.write_manifest);
    }

    #[test]
    fn test_load_from_toml() {
        let mut f = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            f,
            "log_level = \"debug\"\n\n[acquisition]\npacket_buffer_frames = 16\nstop_timeout = \"2s\""
        )
        .unwrap();
        let path = f.path().to_str().unwrap().trim_end_matches(".toml");
        let s = Settings::new(Some(path)).unwrap();
        assert_eq!(s.log_level, "debug");
        assert_eq!(s.acquisition.packet_buffer_frames, 16);
        assert_eq!(s.acquisition.stop_timeout, Duration::from_secs(2));
    }
}
