use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::{
    AudioFormatDescriptor, BufferConverter, NativeFrame, Result, SampleBuffer, SourceAudio,
    SpectrumAnalyzer, SpectrumFrame, TapCallbacks, TapConfig, TapContext, TapHandle, TapHost,
    TapProcessor, TapScopeError, TapStorage,
};

type SharedAnalyzer = Arc<Mutex<Box<dyn SpectrumAnalyzer>>>;

/// Owns the spectrum analyzer and installs taps that feed it.
///
/// Each tap receives a [`TapContext`] that weakly references the manager's
/// current [`TapTarget`]. Releasing the hook drops the manager's strong
/// reference only; the host finalizes the tap, and with it the context, on
/// its own schedule.
///
/// Every hook delivers on its own bounded channel, so a process call still
/// running on a released hook can never reach the consumer of a later one.
pub struct TapManager {
    analyzer: SharedAnalyzer,
    converter: BufferConverter,
    capacity: usize,
    router: Arc<TapRouter>,
    stats: Arc<TapStats>,
    active: Option<ActiveHook>,
}

struct ActiveHook {
    target: Arc<TapTarget>,
    spectra: Receiver<SpectrumFrame>,
}

impl TapManager {
    pub fn new(analyzer: Box<dyn SpectrumAnalyzer>, config: &TapConfig) -> Self {
        Self {
            analyzer: Arc::new(Mutex::new(analyzer)),
            converter: BufferConverter::new(config.missing_channel),
            capacity: config.delivery_capacity.max(1),
            router: Arc::new(TapRouter),
            stats: Arc::new(TapStats::default()),
            active: None,
        }
    }

    /// Receiving end of the active hook's spectrum channel.
    pub fn spectrum_receiver(&self) -> Option<Receiver<SpectrumFrame>> {
        self.active.as_ref().map(|hook| hook.spectra.clone())
    }

    /// Creates a tap on `host` that converts audio described by `format` and
    /// forwards it to the analyzer.
    pub fn create_hook(
        &mut self,
        host: &mut dyn TapHost,
        format: AudioFormatDescriptor,
    ) -> Result<TapHandle> {
        if self.active.is_some() {
            return Err(TapScopeError::msg("a tap is already installed"));
        }

        let (delivery, spectra) = bounded(self.capacity);
        let target = Arc::new(TapTarget {
            format,
            converter: self.converter,
            analyzer: self.analyzer.clone(),
            delivery,
            scratch: Mutex::new(SampleBuffer::empty()),
            stats: self.stats.clone(),
        });
        let context = Arc::new(TapContext::new(&target));
        let callbacks = TapCallbacks {
            client_info: TapStorage::new(context),
            processor: self.router.clone(),
        };

        match host.create_tap(callbacks) {
            Ok(handle) => {
                debug!(tap = handle.id(), ?format, "audio tap created");
                self.active = Some(ActiveHook { target, spectra });
                Ok(handle)
            }
            Err(status) => {
                warn!(status, "host refused to create audio tap");
                Err(TapScopeError::CreationFailed { status })
            }
        }
    }

    /// Drops the strong reference to the current tap target and its channel.
    /// Returns whether a hook was active.
    pub fn release_hook(&mut self) -> bool {
        match self.active.take() {
            Some(hook) => {
                drop(hook.target);
                debug!("audio tap target released");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn stats(&self) -> TapStatsSnapshot {
        self.stats.snapshot()
    }
}

impl fmt::Debug for TapManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapManager")
            .field("converter", &self.converter)
            .field("capacity", &self.capacity)
            .field("active", &self.active.is_some())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Per-hook state reached from the real-time thread.
///
/// The format is fixed before the host can call the tap and only read
/// afterwards. Locks are taken with `try_lock` so the real-time thread never
/// waits; a contended cycle is skipped.
pub struct TapTarget {
    format: AudioFormatDescriptor,
    converter: BufferConverter,
    analyzer: SharedAnalyzer,
    delivery: Sender<SpectrumFrame>,
    scratch: Mutex<SampleBuffer>,
    stats: Arc<TapStats>,
}

impl TapTarget {
    fn process(&self, frame: &NativeFrame<'_>) {
        let Ok(mut scratch) = self.scratch.try_lock() else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if let Err(err) =
            self.converter
                .convert_into(frame, &self.format, frame.frame_count(), &mut scratch)
        {
            self.stats.conversion_failures.fetch_add(1, Ordering::Relaxed);
            debug!(%err, "dropping unconvertible buffer");
            return;
        }

        let Ok(mut analyzer) = self.analyzer.try_lock() else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let spectrum = match analyzer.analyse(&scratch) {
            Ok(spectrum) => spectrum,
            Err(err) => {
                self.stats.analysis_failures.fetch_add(1, Ordering::Relaxed);
                debug!(%err, "spectrum analysis failed");
                return;
            }
        };
        drop(analyzer);

        match self.delivery.try_send(spectrum) {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("spectrum consumer is behind, dropping frame");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Process entry point shared by every tap a manager creates.
struct TapRouter;

impl TapProcessor for TapRouter {
    fn process(&self, storage: &TapStorage, source: &mut dyn SourceAudio, frame_count: usize) {
        let frame = match source.get_source_audio(frame_count) {
            Ok(frame) => frame,
            Err(status) => {
                let err = TapScopeError::EngineReadFailure { status };
                trace!(%err, "skipping tap cycle");
                return;
            }
        };

        let Some(context) = storage.downcast_ref::<TapContext<TapTarget>>() else {
            return;
        };
        let Some(target) = context.upgrade() else {
            trace!("tap target already released, skipping cycle");
            return;
        };

        target.process(&frame);
    }

    fn finalize(&self, storage: TapStorage) {
        debug!(storage = ?storage, "tap finalized");
        drop(storage);
    }
}

#[derive(Debug, Default)]
struct TapStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    conversion_failures: AtomicU64,
    analysis_failures: AtomicU64,
    skipped: AtomicU64,
}

impl TapStats {
    fn snapshot(&self) -> TapStatsSnapshot {
        TapStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
            analysis_failures: self.analysis_failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Counters describing what the real-time path did with each buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TapStatsSnapshot {
    pub delivered: u64,
    pub dropped: u64,
    pub conversion_failures: u64,
    pub analysis_failures: u64,
    pub skipped: u64,
}
