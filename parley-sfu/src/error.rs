use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Admission failures; the Display strings go to clients verbatim.
    #[error("meeting not found")]
    MeetingNotFound,

    #[error("meeting is full")]
    MeetingFull,

    #[error("WebRTC engine error: {0}")]
    Engine(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Invalid track: {0}")]
    InvalidTrack(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::Engine(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
