use thiserror::Error;

pub type Result<T> = std::result::Result<T, HapError>;

#[derive(Debug, Error)]
pub enum HapError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} returned status {code}")]
    Status { url: String, code: u16 },

    /// The accessory server rejected the pin.
    #[error("[{instance}] authorization rejected. Make sure the Homebridge pin for this instance is set to {pin}")]
    Unauthorized { instance: String, pin: String },

    #[error("invalid accessories snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("no characteristic with iid {iid} on accessory {aid}")]
    UnknownCharacteristic { aid: u64, iid: u64 },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HapError {
    /// True for failures that mean the instance could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, HapError::Transport { .. } | HapError::Timeout { .. })
    }
}
