use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Media acquisition failed: {0}")]
    Acquisition(String),

    #[error("Detector initialization failed: {0}")]
    DetectorInit(String),

    #[error("Detection failed: {0}")]
    Detect(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Whether this error is fatal to session startup (nothing should
    /// be spawned, no negotiation may begin).
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, AppError::Acquisition(_) | AppError::DetectorInit(_))
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;
