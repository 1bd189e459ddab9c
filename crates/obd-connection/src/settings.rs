//! Layered settings: defaults, optional TOML file, `OBD__` environment

use crate::ConnectionError;
use obd_protocol::{ClientConfig, ObdProtocol, SerialTransport};
use obd_scheduler::SchedulerConfig;
use recording::RecorderConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Orchestrator tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Name fragments of common adapters, matched against id and label
    pub adapter_patterns: Vec<String>,
    /// Protocols forced in turn when the ECU stays asleep after connect
    pub wake_ladder: Vec<ObdProtocol>,
    /// `0100` probes per wake ladder step
    pub wake_probes: u32,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            adapter_patterns: [
                "OBD", "ELM", "V-LINK", "VLINK", "VEEPEAK", "VGATE", "ICAR", "KONNWEI",
                "FT232", "CH340", "CP210",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            wake_ladder: vec![
                ObdProtocol::Iso9141_2,
                ObdProtocol::Iso14230_4Kwp,
                ObdProtocol::Iso15765_4Can11bit500,
                ObdProtocol::Iso15765_4Can29bit500,
            ],
            wake_probes: 2,
            event_capacity: 64,
        }
    }
}

/// Everything the manager and the binary can be configured with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory of the file-backed store
    pub storage_dir: PathBuf,
    /// Profile used when none is given on the command line
    pub profile: Option<String>,
    /// Serial baud rate
    pub baud_rate: u32,
    pub client: ClientConfig,
    pub scheduler: SchedulerConfig,
    pub recorder: RecorderConfig,
    pub connection: ConnectionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("obd-data"),
            profile: None,
            baud_rate: SerialTransport::DEFAULT_BAUD_RATE,
            client: ClientConfig::default(),
            scheduler: SchedulerConfig::default(),
            recorder: RecorderConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Settings {
    /// Load defaults, then `path` (if given), then `OBD__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConnectionError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading settings file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("OBD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_sources() {
        let settings = Settings::default();
        assert_eq!(settings.connection.wake_probes, 2);
        assert_eq!(settings.recorder.frame_interval_ms, 200);
        assert_eq!(settings.baud_rate, 38400);
        assert_eq!(settings.connection.wake_ladder.len(), 4);
    }

    #[test]
    fn test_toml_overrides_selected_fields() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
profile = "fiesta"
storage_dir = "/tmp/obd"

[client]
can_pid_timeout_ms = 350

[scheduler]
can_strike_limit = 5

[connection]
wake_probes = 1
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.profile.as_deref(), Some("fiesta"));
        assert_eq!(settings.storage_dir, PathBuf::from("/tmp/obd"));
        assert_eq!(settings.client.can_pid_timeout_ms, 350);
        assert_eq!(settings.client.iso_pid_timeout_ms, 1000);
        assert_eq!(settings.scheduler.can_strike_limit, 5);
        assert_eq!(settings.connection.wake_probes, 1);
        assert!(!settings.connection.adapter_patterns.is_empty());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/obd.toml")));
        assert!(matches!(result, Err(ConnectionError::Config(_))));
    }
}
