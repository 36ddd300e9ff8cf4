//! Endpoint configuration
//!
//! One JSON record names the three fabric endpoints:
//!
//! ```json
//! {
//!   "zmq": {
//!     "system_events": "ipc:///run/rnse_control/system_events.ipc",
//!     "tp2_stream": "ipc:///run/rnse_control/tp2_stream.ipc",
//!     "tp2_command": "ipc:///run/rnse_control/tp2_cmd.ipc"
//!   }
//! }
//! ```
//!
//! Every entry is optional; a missing file yields the defaults above.

use std::path::Path;

use serde::Deserialize;

/// Default system-events subscribe address
pub const DEFAULT_SYSTEM_EVENTS: &str = "ipc:///run/rnse_control/system_events.ipc";
/// Default diagnostics stream publish address
pub const DEFAULT_STREAM: &str = "ipc:///run/rnse_control/tp2_stream.ipc";
/// Default command request/reply address
pub const DEFAULT_COMMAND: &str = "ipc:///run/rnse_control/tp2_cmd.ipc";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path that failed to load
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid JSON (or has wrong field types)
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Gateway configuration record
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct Config {
    /// Fabric endpoint addresses
    #[serde(default)]
    pub zmq: Endpoints,
}

/// The three fabric endpoints
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Where ignition events are published
    pub system_events: String,
    /// Where the decoded sample stream is bound
    pub tp2_stream: String,
    /// Where the command request/reply endpoint is bound
    pub tp2_command: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            system_events: DEFAULT_SYSTEM_EVENTS.to_string(),
            tp2_stream: DEFAULT_STREAM.to_string(),
            tp2_command: DEFAULT_COMMAND.to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`. A missing file is not an error;
    /// it yields the documented defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("{} not found, using default endpoints", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load("/nonexistent/tp2d-config.json").unwrap();
        assert_eq!(cfg.zmq.system_events, DEFAULT_SYSTEM_EVENTS);
        assert_eq!(cfg.zmq.tp2_stream, DEFAULT_STREAM);
        assert_eq!(cfg.zmq.tp2_command, DEFAULT_COMMAND);
    }

    #[test]
    fn partial_records_keep_defaults_for_the_rest() {
        let cfg: Config =
            serde_json::from_str(r#"{"zmq": {"tp2_stream": "tcp://*:5557"}}"#).unwrap();
        assert_eq!(cfg.zmq.tp2_stream, "tcp://*:5557");
        assert_eq!(cfg.zmq.tp2_command, DEFAULT_COMMAND);
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"zmq": []}"#).is_err());
    }
}
