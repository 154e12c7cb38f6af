use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_ATHLETE_ID: &str = "0";
pub const MIN_UTC_OFFSET_HOURS: i8 = -12;
pub const MAX_UTC_OFFSET_HOURS: i8 = 14;

/// Timing of the station join sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPolicy {
    pub attempts: u8,
    pub poll_interval_ms: u64,
    pub attempt_timeout_ms: u64,
    pub backoff_ms: u64,
    pub radio_reset_pause_ms: u64,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            poll_interval_ms: 500,
            attempt_timeout_ms: 30_000,
            backoff_ms: 3_000,
            radio_reset_pause_ms: 100,
        }
    }
}

impl JoinPolicy {
    pub fn polls_per_attempt(&self) -> u64 {
        if self.poll_interval_ms == 0 {
            return 1;
        }
        (self.attempt_timeout_ms / self.poll_interval_ms).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshPolicy {
    pub poll_interval_ms: u64,
    pub history_days: u32,
    pub fetch_timeout_ms: u64,
    pub time_sync_polls: u32,
    pub time_sync_poll_ms: u64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            history_days: 30,
            fetch_timeout_ms: 30_000,
            time_sync_polls: 20,
            time_sync_poll_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
}

impl NetworkCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.ssid.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCredentials {
    pub api_key: String,
    pub athlete_id: String,
}

impl Default for RemoteCredentials {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            athlete_id: DEFAULT_ATHLETE_ID.to_string(),
        }
    }
}

impl RemoteCredentials {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn sanitize(&mut self) {
        self.api_key = self.api_key.trim().to_string();
        self.athlete_id = self.athlete_id.trim().to_string();
        if self.athlete_id.is_empty() {
            self.athlete_id = DEFAULT_ATHLETE_ID.to_string();
        }
    }
}

/// Daily refresh target, in local civil time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub hour: u8,
    pub minute: u8,
    #[serde(rename = "utcOffsetHours")]
    pub utc_offset_hours: i8,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hour: 7,
            minute: 0,
            utc_offset_hours: 0,
        }
    }
}

impl ScheduleConfig {
    pub fn sanitize(&mut self) {
        self.hour = self.hour.min(23);
        self.minute = self.minute.min(59);
        self.utc_offset_hours = self
            .utc_offset_hours
            .clamp(MIN_UTC_OFFSET_HOURS, MAX_UTC_OFFSET_HOURS);
    }

    /// Parses "HH:MM". Out-of-range fields are rejected rather than clamped.
    pub fn parse_time(value: &str) -> Option<(u8, u8)> {
        let (hour, minute) = value.trim().split_once(':')?;
        let hour = hour.trim().parse::<u8>().ok()?;
        let minute = minute.trim().parse::<u8>().ok()?;
        (hour <= 23 && minute <= 59).then_some((hour, minute))
    }

    pub fn parse_offset(value: &str) -> Option<i8> {
        let trimmed = value.trim();
        let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
        let offset = trimmed.parse::<i8>().ok()?;
        (MIN_UTC_OFFSET_HOURS..=MAX_UTC_OFFSET_HOURS)
            .contains(&offset)
            .then_some(offset)
    }

    pub fn time_string(&self) -> String {
        format!("{:02}:{:02}", self.hour, self.minute)
    }

    pub fn offset_string(&self) -> String {
        format!("{:+}", self.utc_offset_hours)
    }
}

impl fmt::Display for ScheduleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} UTC{}", self.time_string(), self.offset_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub network: NetworkCredentials,
    pub remote: RemoteCredentials,
    pub schedule: ScheduleConfig,
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.remote.sanitize();
        self.schedule.sanitize();
    }
}
