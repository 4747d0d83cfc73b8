//! Display contract used by the core, plus the text every implementation
//! renders so the wording stays identical between the panel and the host
//! console.

use std::net::Ipv4Addr;

pub const MSG_LINK_LOST: &str = "Lost connection! Reconnecting...";
pub const MSG_LINK_FATAL: &str = "Error connecting to WiFi! Restarting...";
pub const MSG_CONNECTED: &str = "Connected!";
pub const MSG_LOGGING_DISABLED: &str = "Data logging disabled.";
pub const MSG_LOGGING_ENABLED: &str = "Data logging enabled.";
pub const MSG_CARD_FOUND: &str = "Found SD Card!";
pub const MSG_UPDATE_APPLIED: &str = "Update received! Restarting...";
pub const MSG_SENSOR_UNAVAILABLE: &str = "Sensor read failed!";

/// Width of the progress indicator before it wraps back to a single dot.
pub const PROGRESS_MAX_DOTS: usize = 21;

/// Fire-and-forget rendering surface. Implementations swallow their own
/// failures (log a warning at most); data collection never stops because the
/// screen misbehaved.
pub trait Presenter {
    fn show_status(&mut self, text: &str);

    fn show_connecting(&mut self, ssid: &str);

    /// Called once per failed association poll.
    fn show_connect_progress(&mut self, failed_polls: u32);

    fn show_connected(&mut self, ip: Ipv4Addr, channel: u8);

    fn show_signal(&mut self, rssi_dbm: i8);

    fn show_reading(&mut self, temperature_c: f64, relative_humidity_pct: f64);

    fn show_error(&mut self, text: &str);
}

pub fn connecting_text(ssid: &str) -> String {
    format!("Connecting to {ssid}")
}

pub fn progress_text(failed_polls: u32) -> String {
    let dots = (failed_polls as usize % PROGRESS_MAX_DOTS) + 1;
    ".".repeat(dots)
}

pub fn link_text(ip: Ipv4Addr, channel: u8) -> String {
    format!("IP: {ip}    CH: {channel}")
}

pub fn signal_text(rssi_dbm: i8) -> String {
    format!("{rssi_dbm}dBm")
}

pub fn temperature_text(temperature_c: f64) -> String {
    format!("{temperature_c:.1}°C")
}

pub fn humidity_text(relative_humidity_pct: f64) -> String {
    format!("{relative_humidity_pct:.1} %")
}

/// Greedy word wrap for fixed-width fonts. Words longer than a line are split.
pub fn wrap_lines(text: &str, max_cols: usize) -> Vec<String> {
    let max_cols = max_cols.max(1);
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let mut word: Vec<char> = word.chars().collect();
            while word.len() > max_cols {
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
                lines.push(word.drain(..max_cols).collect());
            }
            let word: String = word.into_iter().collect();
            if word.is_empty() {
                continue;
            }

            let needed = if line.is_empty() {
                word.chars().count()
            } else {
                line.chars().count() + 1 + word.chars().count()
            };
            if needed > max_cols {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(&word);
        }
        lines.push(line);
    }

    lines
}
