use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Encoder settings rejected, either by validation or by the native setup call.
    #[error("config error: {0}")]
    Config(String),

    /// An operation was called out of order. The session keeps its prior state.
    #[error("sequence error: {0}")]
    Sequence(String),

    /// The native transform reported an unrecoverable fault. Discard the session.
    #[error("transform fault: {0}")]
    TransformFault(String),

    /// Discontinuity in a decoded bitstream. Resynchronize and continue.
    #[error("stream hole")]
    StreamHole,

    /// A packet could not be copied across the native boundary.
    #[error("marshal error: {0}")]
    Marshal(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn sequence<S: Into<String>>(msg: S) -> Self {
        Error::Sequence(msg.into())
    }

    pub fn fault<S: Into<String>>(msg: S) -> Self {
        Error::TransformFault(msg.into())
    }

    pub fn marshal<S: Into<String>>(msg: S) -> Self {
        Error::Marshal(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Whether the pipeline may skip past this error and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::StreamHole | Error::Marshal(_))
    }
}
