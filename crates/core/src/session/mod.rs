//! Playback session: loads media, installs the tap once the track format is
//! known and republishes spectra and status changes to a delegate.
//!
//! Everything here runs on one coordination thread. Engine notifications are
//! queued on a channel and handled one at a time by [`PlaybackSession::pump`],
//! so no two notifications are ever processed concurrently.

use std::time::Duration;

use crossbeam_channel::{never, select, unbounded, Receiver};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::{
    AppConfig, AudioFormatDescriptor, AudioMix, EngineEvent, FftAnalyzer,
    ItemStatus, MediaEngine, Result, SpectrumAnalyzer, SpectrumFrame, TapConfig, TapHandle,
    TapManager, TapScopeError, TapStatsSnapshot, Track,
};

/// Lifecycle of a [`PlaybackSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Loading,
    /// Tracks are known; waiting for the tap to be installed and the item to
    /// become ready.
    TapPending,
    Playing,
    Failed,
    Stopped,
}

/// Why a session ended up in [`SessionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NoAudioTrack,
    CreationFailed { status: i32 },
    Engine(String),
}

/// Status reported to the [`PlaybackDelegate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStatus {
    TapPending,
    Playing,
    Failed(FailureReason),
    Stopped,
}

/// Consumer of session output. Always called on the coordination thread.
pub trait PlaybackDelegate {
    fn on_spectrum_updated(&mut self, spectrum: &SpectrumFrame);

    fn on_status_changed(&mut self, status: &PlaybackStatus);

    /// Reports tap installation problems that do not end the session.
    fn on_tap_error(&mut self, _error: &TapScopeError) {}
}

enum Pending {
    Event(EngineEvent),
    Spectrum(SpectrumFrame),
    EventsClosed,
}

pub struct PlaybackSession<E: MediaEngine, D: PlaybackDelegate> {
    engine: E,
    delegate: D,
    manager: TapManager,
    spectra: Receiver<SpectrumFrame>,
    state: SessionState,
    events: Option<Receiver<EngineEvent>>,
    audio_track: Option<Track>,
    format: Option<AudioFormatDescriptor>,
    hook: Option<TapHandle>,
    item_ready: bool,
}

impl<E: MediaEngine, D: PlaybackDelegate> PlaybackSession<E, D> {
    pub fn new(
        engine: E,
        analyzer: Box<dyn SpectrumAnalyzer>,
        config: &TapConfig,
        delegate: D,
    ) -> Self {
        Self {
            engine,
            delegate,
            manager: TapManager::new(analyzer, config),
            spectra: never(),
            state: SessionState::Idle,
            events: None,
            audio_track: None,
            format: None,
            hook: None,
            item_ready: false,
        }
    }

    /// Creates a session that analyses with an [`FftAnalyzer`].
    pub fn with_config(engine: E, config: &AppConfig, delegate: D) -> Self {
        let analyzer = FftAnalyzer::new(config.analyzer.clone());
        Self::new(engine, Box::new(analyzer), &config.tap, delegate)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Format captured for the current session, once resolved.
    pub fn format(&self) -> Option<&AudioFormatDescriptor> {
        self.format.as_ref()
    }

    pub fn hook(&self) -> Option<&TapHandle> {
        self.hook.as_ref()
    }

    pub fn tap_stats(&self) -> TapStatsSnapshot {
        self.manager.stats()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    /// Starts a fresh session for `source`.
    ///
    /// A running session is stopped first. Fails with
    /// [`TapScopeError::NoAudioTrack`] when the media has no audio track; in
    /// that case no tap is ever created.
    pub fn play(&mut self, source: &E::Source) -> Result<()> {
        if !matches!(self.state, SessionState::Idle | SessionState::Stopped) {
            self.stop();
        }

        self.audio_track = None;
        self.format = None;
        self.hook = None;
        self.spectra = never();
        self.item_ready = false;

        let (events, receiver) = unbounded();
        self.events = Some(receiver);
        self.state = SessionState::Loading;
        debug!("loading media");

        let tracks = match self.engine.load(source, events) {
            Ok(tracks) => tracks,
            Err(err) => {
                warn!(%err, "media failed to load");
                self.fail(FailureReason::Engine(err.to_string()));
                return Err(err);
            }
        };

        let Some(track) = tracks.into_iter().find(Track::is_audio) else {
            warn!("media has no audio track");
            self.fail(FailureReason::NoAudioTrack);
            return Err(TapScopeError::NoAudioTrack);
        };

        debug!(track = track.id, "audio track found");
        self.audio_track = Some(track);
        Ok(())
    }

    pub fn pause(&mut self) {
        if matches!(self.state, SessionState::TapPending | SessionState::Playing) {
            self.engine.pause();
        }
    }

    pub fn resume(&mut self) {
        if matches!(self.state, SessionState::TapPending | SessionState::Playing) && self.item_ready
        {
            self.engine.play();
        }
    }

    /// Tears the session down. Calling it again is a no-op.
    ///
    /// The tap is removed from the engine's processing graph but not waited
    /// for; the engine finalizes it whenever its render thread lets go. The
    /// session stops listening to that tap's channel, so spectra it still
    /// produces are discarded.
    pub fn stop(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Stopped) {
            return;
        }

        self.engine.set_audio_mix(None);
        self.hook = None;
        self.manager.release_hook();
        self.events = None;
        self.engine.unload();
        self.spectra = never();

        info!("playback stopped");
        self.set_state(SessionState::Stopped, PlaybackStatus::Stopped);
    }

    /// Handles every queued notification and spectrum without blocking.
    /// Returns the number of items handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.events.as_ref().and_then(|events| events.try_recv().ok()) {
            self.handle_event(event);
            handled += 1;
        }

        while let Ok(spectrum) = self.spectra.try_recv() {
            self.deliver(spectrum);
            handled += 1;
        }

        handled
    }

    /// Waits up to `timeout` for the next notification or spectrum, then
    /// drains everything queued.
    pub fn pump_timeout(&mut self, timeout: Duration) -> usize {
        let pending = match &self.events {
            Some(events) => select! {
                recv(events) -> msg => match msg {
                    Ok(event) => Some(Pending::Event(event)),
                    Err(_) => Some(Pending::EventsClosed),
                },
                recv(self.spectra) -> msg => msg.ok().map(Pending::Spectrum),
                default(timeout) => None,
            },
            None => self.spectra.recv_timeout(timeout).ok().map(Pending::Spectrum),
        };

        let handled = match pending {
            Some(Pending::Event(event)) => {
                self.handle_event(event);
                1
            }
            Some(Pending::Spectrum(spectrum)) => {
                self.deliver(spectrum);
                1
            }
            Some(Pending::EventsClosed) => {
                debug!("engine closed its event queue");
                self.events = None;
                0
            }
            None => 0,
        };

        handled + self.pump()
    }

    fn handle_event(&mut self, event: EngineEvent) {
        if !matches!(
            self.state,
            SessionState::Loading | SessionState::TapPending | SessionState::Playing
        ) {
            trace!(?event, state = ?self.state, "ignoring engine event");
            return;
        }

        match event {
            EngineEvent::TracksChanged(tracks) => self.on_tracks_changed(tracks),
            EngineEvent::StatusChanged(status) => self.on_item_status(status),
        }
    }

    fn on_tracks_changed(&mut self, tracks: Vec<Track>) {
        if tracks.is_empty() {
            return;
        }

        if let Some(current) = &mut self.audio_track {
            let updated = tracks
                .iter()
                .find(|track| track.id == current.id && track.stream_description.is_some());
            if let Some(track) = updated {
                current.stream_description = track.stream_description;
            }
        }

        if self.state == SessionState::Loading {
            self.set_state(SessionState::TapPending, PlaybackStatus::TapPending);
        }

        if self.state == SessionState::TapPending && self.format.is_none() {
            self.install_tap();
        }
    }

    fn on_item_status(&mut self, status: ItemStatus) {
        debug!(?status, "item status changed");
        match status {
            ItemStatus::ReadyToPlay => {
                if !self.item_ready {
                    self.item_ready = true;
                    self.engine.play();
                }
                self.promote_if_ready();
            }
            ItemStatus::Failed(message) => {
                warn!(%message, "media item failed");
                self.fail(FailureReason::Engine(message));
            }
            ItemStatus::Unknown => {}
        }
    }

    fn install_tap(&mut self) {
        let Some(track) = &self.audio_track else {
            return;
        };
        let track_id = track.id;

        let format = track
            .stream_description
            .ok_or_else(|| {
                TapScopeError::FormatUnresolvable(
                    "audio track has no stream description".to_string(),
                )
            })
            .and_then(|description| description.resolve());
        let format = match format {
            Ok(format) => format,
            Err(err) => {
                warn!(%err, track = track_id, "tap installation deferred");
                self.delegate.on_tap_error(&err);
                return;
            }
        };

        self.format = Some(format);
        match self.manager.create_hook(&mut self.engine, format) {
            Ok(tap) => {
                info!(track = track_id, tap = tap.id(), "audio tap installed");
                if let Some(spectra) = self.manager.spectrum_receiver() {
                    self.spectra = spectra;
                }
                self.engine.set_audio_mix(Some(AudioMix {
                    track_id,
                    tap: tap.clone(),
                }));
                self.hook = Some(tap);
                self.promote_if_ready();
            }
            Err(TapScopeError::CreationFailed { status }) => {
                self.fail(FailureReason::CreationFailed { status });
            }
            Err(err) => {
                self.fail(FailureReason::Engine(err.to_string()));
            }
        }
    }

    fn promote_if_ready(&mut self) {
        if self.state == SessionState::TapPending && self.hook.is_some() && self.item_ready {
            self.set_state(SessionState::Playing, PlaybackStatus::Playing);
        }
    }

    fn deliver(&mut self, spectrum: SpectrumFrame) {
        if matches!(self.state, SessionState::TapPending | SessionState::Playing) {
            self.delegate.on_spectrum_updated(&spectrum);
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        if self.state == SessionState::Failed {
            return;
        }
        self.set_state(SessionState::Failed, PlaybackStatus::Failed(reason));
    }

    fn set_state(&mut self, state: SessionState, status: PlaybackStatus) {
        debug!(from = ?self.state, to = ?state, "session state changed");
        self.state = state;
        self.delegate.on_status_changed(&status);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use crossbeam_channel::Sender;

    use super::*;
    use crate::{
        NativeFrame, RawBuffer, SampleBuffer, SampleFormat, SourceAudio, StreamDescription,
        TapCallbacks, TapHost,
    };

    #[derive(Default)]
    struct RecordingDelegate {
        statuses: Vec<PlaybackStatus>,
        spectra: Vec<SpectrumFrame>,
        tap_errors: usize,
    }

    impl PlaybackDelegate for RecordingDelegate {
        fn on_spectrum_updated(&mut self, spectrum: &SpectrumFrame) {
            self.spectra.push(spectrum.clone());
        }

        fn on_status_changed(&mut self, status: &PlaybackStatus) {
            self.statuses.push(status.clone());
        }

        fn on_tap_error(&mut self, _error: &TapScopeError) {
            self.tap_errors += 1;
        }
    }

    #[derive(Default)]
    struct ScriptedEngine {
        tracks: Vec<Track>,
        on_load: Vec<EngineEvent>,
        refuse_tap: Option<i32>,
        events: Option<Sender<EngineEvent>>,
        mix: Option<AudioMix>,
        calls: Vec<&'static str>,
    }

    impl ScriptedEngine {
        fn post(&self, event: EngineEvent) {
            if let Some(events) = &self.events {
                events.send(event).unwrap();
            }
        }

        fn count(&self, call: &str) -> usize {
            self.calls.iter().filter(|c| **c == call).count()
        }
    }

    impl TapHost for ScriptedEngine {
        fn create_tap(&mut self, callbacks: TapCallbacks) -> std::result::Result<TapHandle, i32> {
            self.calls.push("create_tap");
            match self.refuse_tap {
                Some(status) => Err(status),
                None => Ok(TapHandle::create(callbacks)),
            }
        }
    }

    impl MediaEngine for ScriptedEngine {
        type Source = ();

        fn load(&mut self, _source: &(), events: Sender<EngineEvent>) -> Result<Vec<Track>> {
            self.calls.push("load");
            for event in &self.on_load {
                events.send(event.clone()).unwrap();
            }
            self.events = Some(events);
            Ok(self.tracks.clone())
        }

        fn set_audio_mix(&mut self, mix: Option<AudioMix>) {
            self.calls.push(if mix.is_some() { "mix" } else { "clear_mix" });
            self.mix = mix;
        }

        fn play(&mut self) {
            self.calls.push("play");
        }

        fn pause(&mut self) {
            self.calls.push("pause");
        }

        fn unload(&mut self) {
            self.calls.push("unload");
            self.events = None;
        }
    }

    struct CountingAnalyzer {
        calls: Arc<AtomicUsize>,
    }

    impl SpectrumAnalyzer for CountingAnalyzer {
        fn analyse(&mut self, _buffer: &SampleBuffer) -> Result<SpectrumFrame> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SpectrumFrame::new(vec![vec![call as f32]]))
        }
    }

    struct StereoSource {
        buffers: Vec<RawBuffer>,
    }

    impl SourceAudio for StereoSource {
        fn get_source_audio(
            &mut self,
            frame_count: usize,
        ) -> std::result::Result<NativeFrame<'_>, i32> {
            Ok(NativeFrame::new(&self.buffers, frame_count))
        }
    }

    fn stereo_description() -> StreamDescription {
        StreamDescription::linear_pcm(48_000.0, 2, SampleFormat::F32, true)
    }

    fn audio_track(description: Option<StreamDescription>) -> Track {
        Track::audio(1, description)
    }

    fn session(
        engine: ScriptedEngine,
    ) -> (PlaybackSession<ScriptedEngine, RecordingDelegate>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let session = PlaybackSession::new(
            engine,
            Box::new(CountingAnalyzer {
                calls: calls.clone(),
            }),
            &TapConfig::default(),
            RecordingDelegate::default(),
        );
        (session, calls)
    }

    fn ready_engine() -> ScriptedEngine {
        let track = audio_track(Some(stereo_description()));
        ScriptedEngine {
            tracks: vec![track.clone()],
            on_load: vec![
                EngineEvent::TracksChanged(vec![track]),
                EngineEvent::StatusChanged(ItemStatus::ReadyToPlay),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn media_without_audio_fails_once_without_a_tap() {
        let engine = ScriptedEngine {
            tracks: vec![Track {
                id: 3,
                media_type: crate::MediaType::Video,
                stream_description: None,
            }],
            ..Default::default()
        };
        let (mut session, _) = session(engine);

        let err = session.play(&()).unwrap_err();
        session.pump();

        assert!(matches!(err, TapScopeError::NoAudioTrack));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            session.delegate().statuses,
            vec![PlaybackStatus::Failed(FailureReason::NoAudioTrack)]
        );
        assert_eq!(session.engine().count("create_tap"), 0);
    }

    #[test]
    fn installs_tap_and_plays_once_tracks_and_status_arrive() {
        let (mut session, _) = session(ready_engine());
        session.play(&()).unwrap();
        assert_eq!(session.state(), SessionState::Loading);

        session.pump();

        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(
            session.delegate().statuses,
            vec![PlaybackStatus::TapPending, PlaybackStatus::Playing]
        );
        assert_eq!(session.engine().count("create_tap"), 1);
        assert_eq!(session.engine().count("play"), 1);
        assert!(session.engine().mix.is_some());
        assert_eq!(session.format().map(|f| f.channels()), Some(2));
    }

    #[test]
    fn ready_status_may_arrive_before_tracks() {
        let mut engine = ready_engine();
        engine.on_load.reverse();
        let (mut session, _) = session(engine);

        session.play(&()).unwrap();
        session.pump();

        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(session.engine().count("create_tap"), 1);
    }

    #[test]
    fn tap_is_installed_at_most_once() {
        let (mut session, _) = session(ready_engine());
        session.play(&()).unwrap();
        session.pump();

        let tracks = vec![audio_track(Some(stereo_description()))];
        session
            .engine()
            .post(EngineEvent::TracksChanged(tracks.clone()));
        session.engine().post(EngineEvent::TracksChanged(tracks));
        session.pump();

        assert_eq!(session.engine().count("create_tap"), 1);
        assert_eq!(session.engine().count("mix"), 1);
    }

    #[test]
    fn unresolvable_format_parks_session_until_resolved() {
        let track = audio_track(None);
        let engine = ScriptedEngine {
            tracks: vec![track.clone()],
            on_load: vec![
                EngineEvent::StatusChanged(ItemStatus::ReadyToPlay),
                EngineEvent::TracksChanged(vec![track]),
            ],
            ..Default::default()
        };
        let (mut session, _) = session(engine);
        session.play(&()).unwrap();
        session.pump();

        assert_eq!(session.state(), SessionState::TapPending);
        assert_eq!(session.delegate().tap_errors, 1);
        assert!(session.format().is_none());
        assert_eq!(session.engine().count("create_tap"), 0);

        session
            .engine()
            .post(EngineEvent::TracksChanged(vec![audio_track(Some(
                stereo_description(),
            ))]));
        session.pump();

        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(session.engine().count("create_tap"), 1);
    }

    #[test]
    fn refused_tap_fails_the_session() {
        let mut engine = ready_engine();
        engine.refuse_tap = Some(-12);
        let (mut session, _) = session(engine);

        session.play(&()).unwrap();
        session.pump();
        session
            .engine()
            .post(EngineEvent::TracksChanged(vec![audio_track(Some(
                stereo_description(),
            ))]));
        session.pump();

        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            session.delegate().statuses,
            vec![
                PlaybackStatus::TapPending,
                PlaybackStatus::Failed(FailureReason::CreationFailed { status: -12 }),
            ]
        );
        assert_eq!(session.engine().count("create_tap"), 1);
    }

    #[test]
    fn engine_failure_is_reported_once() {
        let (mut session, _) = session(ready_engine());
        session.play(&()).unwrap();
        session.pump();

        let failed = EngineEvent::StatusChanged(ItemStatus::Failed("decoder error".into()));
        session.engine().post(failed.clone());
        session.engine().post(failed);
        session.pump();

        assert_eq!(session.state(), SessionState::Failed);
        let failures = session
            .delegate()
            .statuses
            .iter()
            .filter(|status| matches!(status, PlaybackStatus::Failed(_)))
            .count();
        assert_eq!(failures, 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut session, _) = session(ready_engine());
        session.play(&()).unwrap();
        session.pump();

        session.stop();
        let calls_after_first = session.engine().calls.len();
        session.stop();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.engine().calls.len(), calls_after_first);
        assert_eq!(session.engine().count("clear_mix"), 1);
        assert_eq!(session.engine().count("unload"), 1);
        assert_eq!(
            session.delegate().statuses.last(),
            Some(&PlaybackStatus::Stopped)
        );
        assert!(session.engine().mix.is_none());
        assert!(session.hook().is_none());
    }

    #[test]
    fn spectra_reach_the_delegate_in_order() {
        let (mut session, analyses) = session(ready_engine());
        session.play(&()).unwrap();
        session.pump();

        let tap = session.engine().mix.as_ref().unwrap().tap.clone();
        let mut source = StereoSource {
            buffers: vec![RawBuffer::from_samples(2, &[0.25_f32; 128])],
        };
        for _ in 0..3 {
            tap.process(&mut source, 64);
        }
        session.pump();

        let values: Vec<f32> = session
            .delegate()
            .spectra
            .iter()
            .map(|frame| frame.channels()[0][0])
            .collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
        assert_eq!(analyses.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn taps_outliving_the_session_do_nothing() {
        let (mut session, analyses) = session(ready_engine());
        session.play(&()).unwrap();
        session.pump();

        let lingering = session.engine().mix.as_ref().unwrap().tap.clone();
        session.stop();

        let mut source = StereoSource {
            buffers: vec![RawBuffer::from_samples(2, &[0.25_f32; 128])],
        };
        lingering.process(&mut source, 64);
        session.pump();

        assert_eq!(analyses.load(Ordering::SeqCst), 0);
        assert!(session.delegate().spectra.is_empty());
    }

    struct GatedAnalyzer {
        entered: Sender<()>,
        release: crossbeam_channel::Receiver<()>,
    }

    impl SpectrumAnalyzer for GatedAnalyzer {
        fn analyse(&mut self, _buffer: &SampleBuffer) -> Result<SpectrumFrame> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(SpectrumFrame::new(vec![vec![1.0]]))
        }
    }

    #[test]
    fn in_flight_spectra_do_not_reach_the_next_session() {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let mut session = PlaybackSession::new(
            ready_engine(),
            Box::new(GatedAnalyzer {
                entered: entered_tx,
                release: release_rx,
            }),
            &TapConfig::default(),
            RecordingDelegate::default(),
        );
        session.play(&()).unwrap();
        session.pump();

        let tap = session.engine().mix.as_ref().unwrap().tap.clone();
        let render = std::thread::spawn(move || {
            let mut source = StereoSource {
                buffers: vec![RawBuffer::from_samples(2, &[0.25_f32; 128])],
            };
            tap.process(&mut source, 64);
        });

        entered_rx.recv().unwrap();
        session.stop();
        release_tx.send(()).unwrap();
        render.join().unwrap();

        session.play(&()).unwrap();
        session.pump();

        assert_eq!(session.state(), SessionState::Playing);
        assert!(session.delegate().spectra.is_empty());
    }

    #[test]
    fn play_after_stop_starts_a_fresh_session() {
        let (mut session, _) = session(ready_engine());
        session.play(&()).unwrap();
        session.pump();
        let first = session.hook().cloned();
        session.stop();

        session.play(&()).unwrap();
        session.pump();

        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(session.engine().count("create_tap"), 2);
        assert_ne!(session.hook().cloned(), first);
    }

    #[test]
    fn pause_and_resume_forward_to_the_engine() {
        let (mut session, _) = session(ready_engine());
        session.pause();
        assert_eq!(session.engine().count("pause"), 0);

        session.play(&()).unwrap();
        session.pump();
        session.pause();
        session.resume();

        assert_eq!(session.engine().count("pause"), 1);
        assert_eq!(session.engine().count("play"), 2);
        assert_eq!(session.state(), SessionState::Playing);
    }

    #[test]
    fn pump_timeout_returns_when_idle() {
        let (mut session, _) = session(ScriptedEngine::default());
        assert_eq!(session.pump_timeout(Duration::from_millis(5)), 0);
    }
}
