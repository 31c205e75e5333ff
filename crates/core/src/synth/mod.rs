//! In-process media engine that renders sine tones.
//!
//! [`SynthEngine`] implements [`MediaEngine`] without any platform audio
//! stack: it reports one audio track, renders tones into native buffers of
//! the requested layout and drives the installed tap once per render cycle.
//! In realtime mode rendering happens on a dedicated thread paced to the
//! sample rate; in manual mode the caller renders cycles explicitly.

use std::{
    f64::consts::TAU,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    AudioMix, EngineEvent, ItemStatus, MediaEngine, MediaType, NativeFrame, RawBuffer, Result,
    SampleFormat, SourceAudio, StreamDescription, TapCallbacks, TapHandle, TapHost,
    TapScopeError, Track,
};

const AUDIO_TRACK_ID: u32 = 1;
const VIDEO_TRACK_ID: u32 = 2;

/// Description of the tone a [`SynthEngine`] renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthSource {
    pub sample_rate: f64,
    pub channels: usize,
    pub sample_format: SampleFormat,
    pub interleaved: bool,
    /// Tone frequency per channel; reused cyclically when shorter than the
    /// channel count.
    pub frequencies: Vec<f32>,
    pub amplitude: f32,
    pub frames_per_cycle: usize,
    /// Stop rendering after this many seconds; `None` renders forever.
    pub duration_secs: Option<f64>,
    /// Whether the item has an audio track at all.
    pub has_audio: bool,
    /// Whether the stream description is known at load time. When `false`
    /// the description is published once playback starts.
    pub announce_format: bool,
}

impl Default for SynthSource {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            channels: 2,
            sample_format: SampleFormat::F32,
            interleaved: true,
            frequencies: vec![440.0, 660.0],
            amplitude: 0.8,
            frames_per_cycle: 1024,
            duration_secs: None,
            has_audio: true,
            announce_format: true,
        }
    }
}

impl SynthSource {
    pub fn stream_description(&self) -> StreamDescription {
        StreamDescription::linear_pcm(
            self.sample_rate,
            self.channels as u32,
            self.sample_format,
            self.interleaved,
        )
    }

    fn validate(&self) -> Result<()> {
        if self.frames_per_cycle == 0 {
            return Err(TapScopeError::Engine(
                "frames_per_cycle must be at least 1".to_string(),
            ));
        }
        if self.has_audio && self.channels == 0 {
            return Err(TapScopeError::Engine("audio source has no channels".to_string()));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(TapScopeError::Engine(format!(
                "invalid sample rate {}",
                self.sample_rate
            )));
        }
        Ok(())
    }

    fn tracks(&self, with_description: bool) -> Vec<Track> {
        if !self.has_audio {
            return vec![Track {
                id: VIDEO_TRACK_ID,
                media_type: MediaType::Video,
                stream_description: None,
            }];
        }

        let description = with_description.then(|| self.stream_description());
        vec![Track::audio(AUDIO_TRACK_ID, description)]
    }

    fn total_frames(&self) -> Option<usize> {
        self.duration_secs
            .map(|secs| (secs.max(0.0) * self.sample_rate).round() as usize)
    }
}

type Graph = Arc<Mutex<Option<AudioMix>>>;

/// Tone generator plus the native buffers it renders into.
struct Renderer {
    source: SynthSource,
    phases: Vec<f64>,
    buffers: Vec<RawBuffer>,
    channel_scratch: Vec<f32>,
    rendered: usize,
}

impl Renderer {
    fn new(source: SynthSource) -> Self {
        let buffers = if source.interleaved {
            vec![RawBuffer::new(source.channels as u32, Vec::new())]
        } else {
            (0..source.channels)
                .map(|_| RawBuffer::new(1, Vec::new()))
                .collect()
        };

        Self {
            phases: vec![0.0; source.channels],
            buffers,
            channel_scratch: Vec::new(),
            rendered: 0,
            source,
        }
    }

    fn finished(&self) -> bool {
        self.source
            .total_frames()
            .map(|limit| self.rendered >= limit)
            .unwrap_or(false)
    }

    fn render(&mut self) -> usize {
        let remaining = self
            .source
            .total_frames()
            .map(|limit| limit.saturating_sub(self.rendered))
            .unwrap_or(usize::MAX);
        let frames = self.source.frames_per_cycle.min(remaining);
        let channels = self.source.channels;

        self.channel_scratch.clear();
        self.channel_scratch.resize(frames * channels, 0.0);
        for channel in 0..channels {
            let frequency = self
                .source
                .frequencies
                .get(channel % self.source.frequencies.len().max(1))
                .copied()
                .unwrap_or(0.0) as f64;
            let step = TAU * frequency / self.source.sample_rate;
            let mut phase = self.phases[channel];
            for frame in 0..frames {
                self.channel_scratch[frame * channels + channel] =
                    self.source.amplitude * phase.sin() as f32;
                phase = (phase + step) % TAU;
            }
            self.phases[channel] = phase;
        }

        let format = self.source.sample_format;
        if self.source.interleaved {
            encode(&mut self.buffers[0], format, self.channel_scratch.iter().copied());
        } else {
            for (channel, buffer) in self.buffers.iter_mut().enumerate() {
                let samples = self
                    .channel_scratch
                    .iter()
                    .skip(channel)
                    .step_by(channels)
                    .copied();
                encode(buffer, format, samples);
            }
        }

        self.rendered += frames;
        frames
    }

    /// Renders one cycle and pushes it through the installed tap, if any.
    fn cycle(&mut self, graph: &Mutex<Option<AudioMix>>) -> bool {
        if self.finished() {
            return false;
        }

        let frames = self.render();
        let tap = graph
            .lock()
            .ok()
            .and_then(|mix| mix.as_ref().map(|mix| mix.tap.clone()));
        if let Some(tap) = tap {
            let mut source = RenderedAudio {
                buffers: &self.buffers,
                frames,
            };
            tap.process(&mut source, frames);
        }
        true
    }
}

fn encode(buffer: &mut RawBuffer, format: SampleFormat, samples: impl Iterator<Item = f32>) {
    match format {
        SampleFormat::F32 => buffer.write_samples(samples),
        SampleFormat::I16 => {
            buffer.write_samples(samples.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        }
        SampleFormat::I32 => buffer.write_samples(
            samples.map(|v| (v.clamp(-1.0, 1.0) as f64 * i32::MAX as f64) as i32),
        ),
        SampleFormat::Unsupported {
            bits_per_sample, ..
        } => {
            let bytes = samples.count() * (bits_per_sample as usize / 8).max(1);
            *buffer = RawBuffer::new(buffer.number_channels(), vec![0; bytes]);
        }
    }
}

struct RenderedAudio<'a> {
    buffers: &'a [RawBuffer],
    frames: usize,
}

impl SourceAudio for RenderedAudio<'_> {
    fn get_source_audio(&mut self, frame_count: usize) -> std::result::Result<NativeFrame<'_>, i32> {
        Ok(NativeFrame::new(self.buffers, frame_count.min(self.frames)))
    }
}

struct RenderThread {
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

enum Transport {
    Idle,
    Manual { renderer: Renderer, playing: bool },
    Threaded(RenderThread),
}

/// Tone-rendering [`MediaEngine`].
pub struct SynthEngine {
    threaded: bool,
    paced: bool,
    graph: Graph,
    events: Option<Sender<EngineEvent>>,
    source: Option<SynthSource>,
    transport: Transport,
    cycles: Arc<AtomicU64>,
}

impl SynthEngine {
    /// Engine that renders on its own thread, paced to the sample rate.
    pub fn realtime() -> Self {
        Self::build(true, true)
    }

    /// Engine that renders on its own thread as fast as the tap consumes.
    pub fn unpaced() -> Self {
        Self::build(true, false)
    }

    /// Engine that renders only when [`render_cycles`](Self::render_cycles)
    /// is called.
    pub fn manual() -> Self {
        Self::build(false, false)
    }

    fn build(threaded: bool, paced: bool) -> Self {
        Self {
            threaded,
            paced,
            graph: Arc::new(Mutex::new(None)),
            events: None,
            source: None,
            transport: Transport::Idle,
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of render cycles completed since the engine was created.
    pub fn rendered_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Whether a tap is currently part of the processing graph.
    pub fn has_tap(&self) -> bool {
        self.graph
            .lock()
            .map(|mix| mix.is_some())
            .unwrap_or(false)
    }

    /// Renders up to `count` cycles on the calling thread. Only manual
    /// engines that are playing render; returns the cycles rendered.
    pub fn render_cycles(&mut self, count: usize) -> usize {
        let Transport::Manual {
            renderer,
            playing: true,
        } = &mut self.transport
        else {
            return 0;
        };

        let mut rendered = 0;
        for _ in 0..count {
            if !renderer.cycle(&self.graph) {
                break;
            }
            rendered += 1;
            self.cycles.fetch_add(1, Ordering::Relaxed);
        }
        rendered
    }

    fn post(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("session event queue closed");
            }
        }
    }

    fn start_thread(&mut self, source: SynthSource) -> Result<RenderThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let graph = self.graph.clone();
        let cycles = self.cycles.clone();
        let period = Duration::from_secs_f64(source.frames_per_cycle as f64 / source.sample_rate);
        let paced = self.paced;

        let thread_stop = stop.clone();
        let thread_paused = paused.clone();
        thread::Builder::new()
            .name("tapscope-render".into())
            .spawn(move || {
                let mut renderer = Renderer::new(source);
                while !thread_stop.load(Ordering::Acquire) {
                    if thread_paused.load(Ordering::Acquire) {
                        thread::sleep(period);
                        continue;
                    }
                    if !renderer.cycle(&graph) {
                        debug!("synth source exhausted");
                        break;
                    }
                    cycles.fetch_add(1, Ordering::Relaxed);
                    if paced {
                        thread::sleep(period);
                    }
                }
            })
            .map_err(|err| TapScopeError::Engine(format!("failed to spawn render thread: {err}")))?;

        Ok(RenderThread { stop, paused })
    }

    fn halt(&mut self) {
        if let Transport::Threaded(thread) = &self.transport {
            thread.stop.store(true, Ordering::Release);
        }
        self.transport = Transport::Idle;
    }
}

impl TapHost for SynthEngine {
    fn create_tap(&mut self, callbacks: TapCallbacks) -> std::result::Result<TapHandle, i32> {
        Ok(TapHandle::create(callbacks))
    }
}

impl MediaEngine for SynthEngine {
    type Source = SynthSource;

    fn load(&mut self, source: &SynthSource, events: Sender<EngineEvent>) -> Result<Vec<Track>> {
        self.unload();
        source.validate()?;

        self.events = Some(events);
        self.source = Some(source.clone());

        let tracks = source.tracks(source.announce_format);
        self.post(EngineEvent::TracksChanged(tracks.clone()));
        self.post(EngineEvent::StatusChanged(ItemStatus::ReadyToPlay));
        debug!(?source, "synth item loaded");
        Ok(tracks)
    }

    fn set_audio_mix(&mut self, mix: Option<AudioMix>) {
        // The replaced mix is dropped after the lock is released so a final
        // tap reference is never finalized while the graph is locked.
        let previous = match self.graph.lock() {
            Ok(mut graph) => std::mem::replace(&mut *graph, mix),
            Err(_) => {
                warn!("processing graph lock poisoned");
                return;
            }
        };
        drop(previous);
    }

    fn play(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };

        match &mut self.transport {
            Transport::Threaded(thread) => {
                thread.paused.store(false, Ordering::Release);
                return;
            }
            Transport::Manual { playing, .. } => {
                *playing = true;
                return;
            }
            Transport::Idle => {}
        }

        if !source.announce_format && source.has_audio {
            self.post(EngineEvent::TracksChanged(source.tracks(true)));
        }

        if self.threaded {
            match self.start_thread(source) {
                Ok(thread) => {
                    info!("synth render thread started");
                    self.transport = Transport::Threaded(thread);
                }
                Err(err) => {
                    warn!(%err, "synth playback could not start");
                    self.post(EngineEvent::StatusChanged(ItemStatus::Failed(err.to_string())));
                }
            }
        } else {
            self.transport = Transport::Manual {
                renderer: Renderer::new(source),
                playing: true,
            };
        }
    }

    fn pause(&mut self) {
        match &mut self.transport {
            Transport::Threaded(thread) => thread.paused.store(true, Ordering::Release),
            Transport::Manual { playing, .. } => *playing = false,
            Transport::Idle => {}
        }
    }

    fn unload(&mut self) {
        self.set_audio_mix(None);
        self.halt();
        self.events = None;
        self.source = None;
    }
}

impl Drop for SynthEngine {
    fn drop(&mut self) {
        self.halt();
    }
}

impl fmt::Debug for SynthEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthEngine")
            .field("threaded", &self.threaded)
            .field("paced", &self.paced)
            .field("source", &self.source)
            .field("has_tap", &self.has_tap())
            .field("cycles", &self.rendered_cycles())
            .finish()
    }
}
