//! Host-facing protocol for real-time processing taps.
//!
//! A tap is created from [`TapCallbacks`]: an opaque [`TapStorage`] value and
//! a [`TapProcessor`] implementing the three tap operations. The host runs
//! `init` once while creating the tap, `process` for every render cycle and
//! `finalize` exactly once when the last [`TapHandle`] is dropped. The
//! storage value is owned by the tap between `init` and `finalize` and is
//! released nowhere else.

use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use tracing::{debug, trace};

use crate::NativeFrame;

static NEXT_TAP_ID: AtomicU64 = AtomicU64::new(1);

/// Non-owning link from a running tap back to the object that consumes its
/// audio.
///
/// The host may keep calling `process` after the owner is gone; resolving
/// the link then yields `None` instead of touching freed state.
pub struct TapContext<T: ?Sized> {
    target: Weak<T>,
}

impl<T: ?Sized> TapContext<T> {
    pub fn new(target: &Arc<T>) -> Self {
        Self {
            target: Arc::downgrade(target),
        }
    }

    pub fn upgrade(&self) -> Option<Arc<T>> {
        self.target.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }
}

impl<T: ?Sized> Drop for TapContext<T> {
    fn drop(&mut self) {
        trace!("tap context released");
    }
}

impl<T: ?Sized> fmt::Debug for TapContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapContext")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Opaque value threaded by the host through every tap operation.
#[derive(Clone)]
pub struct TapStorage(Arc<dyn Any + Send + Sync>);

impl TapStorage {
    pub fn new<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(value)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &TapStorage) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of strong references to the stored value.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for TapStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapStorage")
            .field("strong", &self.strong_count())
            .finish()
    }
}

/// Primitive available to a tap only while `process` runs: pulls the next
/// chunk of source audio from the host.
pub trait SourceAudio {
    /// Fills the host's buffers with up to `frame_count` frames. An `Err`
    /// carries the host status code.
    fn get_source_audio(&mut self, frame_count: usize) -> std::result::Result<NativeFrame<'_>, i32>;
}

/// The operations a host invokes on a tap.
pub trait TapProcessor: Send + Sync {
    /// Returns the storage value for the new tap. The default keeps the
    /// client value as is.
    fn init(&self, client_info: TapStorage) -> TapStorage {
        client_info
    }

    /// Runs on the host's real-time thread and must not block.
    fn process(&self, storage: &TapStorage, source: &mut dyn SourceAudio, frame_count: usize);

    /// Receives the storage back exactly once when the tap is destroyed.
    fn finalize(&self, storage: TapStorage) {
        drop(storage);
    }
}

/// Host side of tap creation.
pub trait TapHost {
    /// Creates a tap from `callbacks`. On failure the callbacks, including
    /// the client storage, are dropped and the host status is returned.
    fn create_tap(&mut self, callbacks: TapCallbacks) -> std::result::Result<TapHandle, i32>;
}

/// Everything a host needs to create a tap.
pub struct TapCallbacks {
    pub client_info: TapStorage,
    pub processor: Arc<dyn TapProcessor>,
}

impl fmt::Debug for TapCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapCallbacks")
            .field("client_info", &self.client_info)
            .finish()
    }
}

/// Host-side state of one created tap.
pub struct ProcessingTap {
    id: u64,
    processor: Arc<dyn TapProcessor>,
    storage: Option<TapStorage>,
}

impl ProcessingTap {
    fn create(callbacks: TapCallbacks) -> Self {
        let id = NEXT_TAP_ID.fetch_add(1, Ordering::Relaxed);
        let TapCallbacks {
            client_info,
            processor,
        } = callbacks;
        let storage = processor.init(client_info);
        debug!(tap = id, "processing tap initialised");

        Self {
            id,
            processor,
            storage: Some(storage),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn process(&self, source: &mut dyn SourceAudio, frame_count: usize) {
        if let Some(storage) = &self.storage {
            self.processor.process(storage, source, frame_count);
        }
    }
}

impl Drop for ProcessingTap {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            debug!(tap = self.id, "finalizing processing tap");
            self.processor.finalize(storage);
        }
    }
}

/// Reference-counted handle to a created tap.
///
/// Hosts keep clones in their processing graph; the tap is finalized when the
/// last clone goes away, on whichever thread drops it.
#[derive(Clone)]
pub struct TapHandle(Arc<ProcessingTap>);

impl TapHandle {
    /// Creates a tap and runs its `init` operation.
    pub fn create(callbacks: TapCallbacks) -> Self {
        Self(Arc::new(ProcessingTap::create(callbacks)))
    }

    pub fn id(&self) -> u64 {
        self.0.id()
    }

    /// Runs one render cycle through the tap.
    pub fn process(&self, source: &mut dyn SourceAudio, frame_count: usize) {
        self.0.process(source, frame_count);
    }
}

impl PartialEq for TapHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TapHandle").field(&self.id()).finish()
    }
}
