use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_HOSTNAME: &str = "rssi-logger";
pub const DEFAULT_LOG_PATH: &str = "/data.log";
pub const DEFAULT_UPDATE_PORT: u16 = 3232;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ssid: String,
    pub credential: String,
    pub hostname: String,
    #[serde(rename = "updateAuthToken")]
    pub update_auth_token: String,
}

impl NetworkConfig {
    pub fn has_station_credentials(&self) -> bool {
        !self.ssid.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(rename = "samplePeriodMs")]
    pub sample_period_ms: u32,
    #[serde(rename = "connectPollIntervalMs")]
    pub connect_poll_interval_ms: u32,
    #[serde(rename = "connectMaxPolls")]
    pub connect_max_polls: u32,
    #[serde(rename = "statusHoldMs")]
    pub status_hold_ms: u32,
    #[serde(rename = "noticeHoldMs")]
    pub notice_hold_ms: u32,
    #[serde(rename = "restartDelayMs")]
    pub restart_delay_ms: u32,
    /// Pause between passes that had nothing to sample.
    #[serde(rename = "idlePollMs")]
    pub idle_poll_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: 1_000,
            connect_poll_interval_ms: 100,
            connect_max_polls: 100,
            status_hold_ms: 1_000,
            notice_hold_ms: 2_000,
            restart_delay_ms: 1_000,
            idle_poll_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    #[serde(rename = "logPath")]
    pub log_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: DEFAULT_LOG_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdateConfig {
    #[serde(rename = "listenPort")]
    pub listen_port: u16,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_UPDATE_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub update: UpdateConfig,
}

impl DeviceConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.sanitize();
        Ok(config)
    }

    /// Applies `WIFI_SSID`, `WIFI_KEY`, `HOSTNAME`, `OTA_AUTH` and
    /// `UPDATE_PORT` from whatever lookup the platform provides (process
    /// environment on the host, build-time values on the device).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ssid) = lookup("WIFI_SSID") {
            self.network.ssid = ssid;
        }
        if let Some(key) = lookup("WIFI_KEY") {
            self.network.credential = key;
        }
        if let Some(hostname) = lookup("HOSTNAME") {
            self.network.hostname = hostname;
        }
        if let Some(token) = lookup("OTA_AUTH") {
            self.network.update_auth_token = token;
        }
        if let Some(port) = lookup("UPDATE_PORT") {
            self.update.listen_port = port.trim().parse::<u16>().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "UPDATE_PORT",
                    value: port.clone(),
                }
            })?;
        }
        self.sanitize();
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.network.ssid = self.network.ssid.trim().to_string();
        self.network.hostname = self.network.hostname.trim().to_string();
        if self.network.hostname.is_empty() {
            self.network.hostname = DEFAULT_HOSTNAME.to_string();
        }

        self.timing.sanitize();

        if self.storage.log_path.trim().is_empty() {
            self.storage.log_path = DEFAULT_LOG_PATH.to_string();
        }
        if !self.storage.log_path.starts_with('/') {
            self.storage.log_path.insert(0, '/');
        }

        if self.update.listen_port == 0 {
            self.update.listen_port = DEFAULT_UPDATE_PORT;
        }
    }
}

impl TimingConfig {
    pub fn sanitize(&mut self) {
        self.sample_period_ms = self.sample_period_ms.clamp(100, 3_600_000);
        self.connect_poll_interval_ms = self.connect_poll_interval_ms.clamp(10, 5_000);
        self.connect_max_polls = self.connect_max_polls.clamp(1, 10_000);
        self.status_hold_ms = self.status_hold_ms.min(10_000);
        self.notice_hold_ms = self.notice_hold_ms.min(10_000);
        self.restart_delay_ms = self.restart_delay_ms.min(10_000);
        self.idle_poll_ms = self.idle_poll_ms.clamp(1, self.sample_period_ms / 10);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_device_cadence() {
        let config = DeviceConfig::default();

        assert_eq!(config.timing.sample_period_ms, 1_000);
        assert_eq!(config.timing.connect_poll_interval_ms, 100);
        assert_eq!(config.timing.connect_max_polls, 100);
        assert_eq!(config.storage.log_path, "/data.log");
        assert!(config.storage.enabled);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = DeviceConfig::from_json(
            r#"{"network":{"ssid":" lab ","credential":"pw","hostname":"","updateAuthToken":"tok"}}"#,
        )
        .unwrap();

        assert_eq!(
            config.network,
            NetworkConfig {
                ssid: "lab".to_string(),
                credential: "pw".to_string(),
                hostname: DEFAULT_HOSTNAME.to_string(),
                update_auth_token: "tok".to_string(),
            }
        );
        assert_eq!(config.timing, TimingConfig::default());
    }

    #[test]
    fn sanitize_clamps_timing() {
        let mut timing = TimingConfig {
            sample_period_ms: 5,
            connect_poll_interval_ms: 0,
            connect_max_polls: 0,
            status_hold_ms: 60_000,
            notice_hold_ms: 1,
            restart_delay_ms: 99_999,
            idle_poll_ms: 500,
        };
        timing.sanitize();

        assert_eq!(timing.sample_period_ms, 100);
        assert_eq!(timing.connect_poll_interval_ms, 10);
        assert_eq!(timing.connect_max_polls, 1);
        assert_eq!(timing.status_hold_ms, 10_000);
        assert_eq!(timing.notice_hold_ms, 1);
        assert_eq!(timing.restart_delay_ms, 10_000);
        assert_eq!(timing.idle_poll_ms, 10);
    }

    #[test]
    fn overrides_replace_network_identity() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WIFI_SSID", "field-ap"),
            ("WIFI_KEY", "secret"),
            ("OTA_AUTH", "letmein"),
            ("UPDATE_PORT", "8266"),
        ]);
        let mut config = DeviceConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.network.ssid, "field-ap");
        assert_eq!(config.network.credential, "secret");
        assert_eq!(config.network.hostname, DEFAULT_HOSTNAME);
        assert_eq!(config.network.update_auth_token, "letmein");
        assert_eq!(config.update.listen_port, 8266);
    }

    #[test]
    fn rejects_unparseable_port() {
        let mut config = DeviceConfig::default();
        let err = config
            .apply_overrides(|key| (key == "UPDATE_PORT").then(|| "http".to_string()))
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "UPDATE_PORT",
                ..
            }
        ));
    }

    #[test]
    fn relative_log_path_is_rooted() {
        let mut config = DeviceConfig::default();
        config.storage.log_path = "samples.csv".to_string();
        config.sanitize();

        assert_eq!(config.storage.log_path, "/samples.csv");
    }
}
