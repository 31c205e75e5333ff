//! Core library for Tapscope.
//!
//! Tapscope intercepts the audio a media engine renders for one track,
//! converts each intercepted chunk into an owned [`SampleBuffer`] and feeds
//! it to a [`SpectrumAnalyzer`]. The resulting [`SpectrumFrame`]s are
//! delivered to a [`PlaybackDelegate`] on the coordination thread that owns
//! the [`PlaybackSession`].
//!
//! The real-time side never owns the analyzer: every tap carries a
//! [`TapContext`] that only weakly references it, so a session can be torn
//! down while the engine is still calling into the tap.

pub mod analysis;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod format;
pub mod manager;
pub mod session;
pub mod synth;
pub mod tap;

pub use analysis::{FftAnalyzer, SpectrumAnalyzer, SpectrumFrame};
pub use config::{AnalyzerConfig, AppConfig, TapConfig};
pub use convert::{
    BufferConverter, MissingChannelPolicy, NativeFrame, NativeSample, RawBuffer, SampleBuffer,
    SampleData,
};
pub use engine::{AudioMix, EngineEvent, ItemStatus, MediaEngine, MediaType, Track};
pub use error::{ConversionError, Result, TapScopeError};
pub use format::{AudioFormatDescriptor, SampleFormat, StreamDescription};
pub use manager::{TapManager, TapStatsSnapshot, TapTarget};
pub use session::{
    FailureReason, PlaybackDelegate, PlaybackSession, PlaybackStatus, SessionState,
};
pub use synth::{SynthEngine, SynthSource};
pub use tap::{
    ProcessingTap, SourceAudio, TapCallbacks, TapContext, TapHandle, TapHost, TapProcessor,
    TapStorage,
};
