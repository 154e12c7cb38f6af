use thiserror::Error;

/// Failures of a wellness refresh. None of these are fatal to the device;
/// the worst outcome is serving the previously cached history.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("remote credentials are not configured")]
    NotConfigured,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("empty or malformed wellness response: {0}")]
    EmptyOrMalformed(String),
}

impl FetchError {
    /// Text safe to show in the local UI. Transport details stay in the log.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotConfigured => "API key not configured",
            Self::Transport(_) => "Failed to reach the analytics service",
            Self::EmptyOrMalformed(_) => "No usable wellness data received",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotConfigured => 400,
            Self::Transport(_) | Self::EmptyOrMalformed(_) => 502,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("wifi join failed after {attempts} attempts")]
    JoinExhausted { attempts: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("radio error: {0}")]
pub struct RadioError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("access of {len} bytes at offset {offset} is outside the store")]
    OutOfBounds { offset: usize, len: usize },
    #[error("store backend failure: {0}")]
    Backend(String),
}
