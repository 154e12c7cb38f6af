//! Station join state machine.
//!
//! `ConnectivityManager::establish` decides between joining the configured
//! network and falling back to the setup access point. Every wait is bounded:
//! at most `attempts * (reset pause + polls * poll interval) + backoffs`.

use std::time::Duration;

use log::{info, warn};

use crate::{
    config::{JoinPolicy, NetworkCredentials},
    error::{ConnectError, RadioError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityMode {
    Unconfigured,
    Joining,
    ApFallback,
    Connected,
}

impl ConnectivityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "UNCONFIGURED",
            Self::Joining => "JOINING",
            Self::ApFallback => "AP_FALLBACK",
            Self::Connected => "CONNECTED",
        }
    }
}

/// Station status as reported by the radio while associating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStatus {
    Idle,
    Connecting,
    Connected,
    SsidNotFound,
    AuthFailed,
    Disconnected,
}

impl RadioStatus {
    /// Statuses that end an attempt before its timeout.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Connected | Self::SsidNotFound | Self::AuthFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::SsidNotFound => "SSID_NOT_FOUND",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub mode: ConnectivityMode,
    pub attempts: u8,
        pub last_status: RadioStatus,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            mode: ConnectivityMode::Unconfigured,
            attempts: 0,
            last_status: RadioStatus::Idle,
        }
    }
}

impl ConnectivityState {
    pub fn is_connected(&self) -> bool {
        self.mode == ConnectivityMode::Connected
    }

    pub fn failure(&self) -> Option<ConnectError> {
        (self.mode == ConnectivityMode::ApFallback && self.attempts > 0).then_some(
            ConnectError::JoinExhausted {
                attempts: self.attempts,
            },
        )
    }
}

pub trait Radio {
    fn power_off(&mut self) -> Result<(), RadioError>;
    fn power_on_station(&mut self) -> Result<(), RadioError>;
    fn begin(&mut self, creds: &NetworkCredentials) -> Result<(), RadioError>;
    fn status(&mut self) -> RadioStatus;
    fn disconnect(&mut self) -> Result<(), RadioError>;
    fn set_auto_reconnect(&mut self, enabled: bool);
}

/// Cooperative wait. Implementations yield to the platform while sleeping.
pub trait Pause {
    fn pause(&mut self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct ConnectivityManager {
    policy: JoinPolicy,
    state: ConnectivityState,
}

impl Default for ConnectivityManager {
    fn default() -> Self {
        Self::new(JoinPolicy::default())
    }
}

impl ConnectivityManager {
    pub fn new(policy: JoinPolicy) -> Self {
        Self {
            policy,
            state: ConnectivityState::default(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn establish<R: Radio, P: Pause>(
        &mut self,
        radio: &mut R,
        pause: &mut P,
        creds: &NetworkCredentials,
    ) -> ConnectivityState {
        self.state = ConnectivityState::default();

        if !creds.is_configured() {
            info!("no wifi credentials stored; starting setup access point");
            self.state.mode = ConnectivityMode::ApFallback;
            return self.state;
        }

        self.state.mode = ConnectivityMode::Joining;
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            self.state.attempts = attempt;
            info!("wifi join attempt {attempt}/{attempts} to `{}`", creds.ssid);

            if self.join_once(radio, pause, creds) {
                radio.set_auto_reconnect(true);
                self.state.mode = ConnectivityMode::Connected;
                info!("wifi connected on attempt {attempt}");
                return self.state;
            }

            if attempt < attempts {
                if let Err(err) = radio.disconnect() {
                    warn!("wifi disconnect before retry failed: {err}");
                }
                pause.pause(Duration::from_millis(self.policy.backoff_ms));
            }
        }

        if let Err(err) = radio.disconnect() {
            warn!("wifi disconnect after failed join: {err}");
        }
        self.state.mode = ConnectivityMode::ApFallback;
        if let Some(err) = self.state.failure() {
            warn!("{err}; last status {}", self.state.last_status.as_str());
        }
        self.state
    }

    fn join_once<R: Radio, P: Pause>(
        &mut self,
        radio: &mut R,
        pause: &mut P,
        creds: &NetworkCredentials,
    ) -> bool {
        if let Err(err) = self.reset_radio(radio, pause) {
            warn!("radio reset failed: {err}");
            return false;
        }
        if let Err(err) = radio.begin(creds) {
            warn!("wifi association could not start: {err}");
            return false;
        }

        let mut previous: Option<RadioStatus> = None;
        for _ in 0..self.policy.polls_per_attempt() {
            let status = radio.status();
            if previous != Some(status) {
                info!("wifi status: {}", status.as_str());
                previous = Some(status);
            }
            self.state.last_status = status;

            if status.is_terminal() {
                return status == RadioStatus::Connected;
            }
            pause.pause(Duration::from_millis(self.policy.poll_interval_ms));
        }

        warn!(
            "wifi attempt timed out after {} ms",
            self.policy.attempt_timeout_ms
        );
        false
    }

    fn reset_radio<R: Radio, P: Pause>(
        &self,
        radio: &mut R,
        pause: &mut P,
    ) -> Result<(), RadioError> {
        radio.power_off()?;
        pause.pause(Duration::from_millis(self.policy.radio_reset_pause_ms));
        radio.power_on_station()
    }
}
