//! Contract between a [`PlaybackSession`](crate::PlaybackSession) and the
//! media engine that decodes and renders the audio.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::{Result, StreamDescription, TapHandle, TapHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
    Other,
}

/// One track of a loaded media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: u32,
    pub media_type: MediaType,
    /// Stream description of the track, when the engine knows it already.
    pub stream_description: Option<StreamDescription>,
}

impl Track {
    pub fn audio(id: u32, stream_description: Option<StreamDescription>) -> Self {
        Self {
            id,
            media_type: MediaType::Audio,
            stream_description,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.media_type == MediaType::Audio
    }
}

/// Readiness of the current media item as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Unknown,
    ReadyToPlay,
    Failed(String),
}

/// Notifications an engine posts to the session's event queue.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The item's track list changed.
    TracksChanged(Vec<Track>),
    StatusChanged(ItemStatus),
}

/// Routes one track through a tap before it reaches the output mix.
#[derive(Debug, Clone)]
pub struct AudioMix {
    pub track_id: u32,
    pub tap: TapHandle,
}

/// A media engine able to load items, report their tracks and status, and
/// host processing taps.
///
/// All methods are called from the session's coordination thread. Events are
/// posted to the sender handed to [`load`](MediaEngine::load) and may be
/// posted from any thread.
pub trait MediaEngine: TapHost {
    type Source;

    /// Starts loading `source` and returns the tracks of its asset.
    fn load(&mut self, source: &Self::Source, events: Sender<EngineEvent>) -> Result<Vec<Track>>;

    /// Replaces the processing graph of the current item. `None` removes all
    /// taps; the engine finalizes them once it no longer renders through them.
    fn set_audio_mix(&mut self, mix: Option<AudioMix>);

    fn play(&mut self);

    fn pause(&mut self);

    /// Releases the current item and stops posting events for it.
    fn unload(&mut self);
}
