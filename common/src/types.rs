use std::{fmt::Write as _, net::Ipv4Addr};

use serde::{Deserialize, Serialize};

pub const LOG_HEADER: &str = "millis;rssi;t;rh\n";
pub const LOG_DELIMITER: char = ';';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogState {
    Unopened,
    Enabled,
    Disabled,
}

impl LogState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unopened => "UNOPENED",
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Climate {
    #[serde(rename = "temperatureC")]
    pub temperature_c: f64,
    #[serde(rename = "relativeHumidityPct")]
    pub relative_humidity_pct: f64,
}

/// One tick's worth of measurements. Built once, handed to the presenter and
/// the storage logger, then dropped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "timestampMillis")]
    pub timestamp_ms: u32,
    #[serde(rename = "signalStrengthDbm")]
    pub rssi_dbm: i8,
    pub climate: Option<Climate>,
}

impl Sample {
    /// Renders the record exactly as it lands in the log file. A missing
    /// climate reading leaves both fields empty so the column count stays
    /// fixed.
    pub fn to_log_line(&self) -> String {
        let mut line = String::with_capacity(48);
        let _ = write!(
            line,
            "{}{LOG_DELIMITER}{}{LOG_DELIMITER}",
            self.timestamp_ms, self.rssi_dbm
        );
        if let Some(climate) = self.climate {
            let _ = write!(
                line,
                "{:.6}{LOG_DELIMITER}{:.6}",
                climate.temperature_c, climate.relative_humidity_pct
            );
        } else {
            line.push(LOG_DELIMITER);
        }
        line.push('\n');
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub ip: Ipv4Addr,
    pub channel: u8,
}

impl Default for LinkInfo {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            channel: 0,
        }
    }
}
