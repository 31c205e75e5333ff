use crate::format::SampleFormat;

/// Result alias that carries the custom [`TapScopeError`] type.
pub type Result<T> = std::result::Result<T, TapScopeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum TapScopeError {
    /// The loaded media does not expose a single audio track.
    #[error("no audio track found")]
    NoAudioTrack,
    /// The audio track's stream description could not be turned into an
    /// [`AudioFormatDescriptor`](crate::AudioFormatDescriptor).
    #[error("audio format could not be resolved: {0}")]
    FormatUnresolvable(String),
    /// The host engine refused to create the processing tap.
    #[error("failed to create audio processing tap (status {status})")]
    CreationFailed { status: i32 },
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    /// Fetching the source audio inside a process callback failed.
    #[error("engine failed to provide source audio (status {status})")]
    EngineReadFailure { status: i32 },
    #[error("spectrum analysis failed: {0}")]
    Analysis(String),
    #[error("media engine error: {0}")]
    Engine(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
}

impl TapScopeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for TapScopeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for TapScopeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Failure to convert one native frame into a [`SampleBuffer`](crate::SampleBuffer).
///
/// The type is `Copy` and carries no heap data so it can be produced and
/// logged on the real-time thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("format mismatch: expected {expected} {what}, found {found}")]
    FormatMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("unsupported sample format {0:?}")]
    UnsupportedFormat(SampleFormat),
    #[error("source data for channel {channel} is unavailable")]
    SourceUnavailable { channel: usize },
}
