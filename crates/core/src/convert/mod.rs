//! Conversion of engine-owned native frames into owned [`SampleBuffer`]s.
//!
//! A [`NativeFrame`] borrows the raw byte buffers an engine fills during one
//! process callback. The borrow ends with the callback, so anything that must
//! outlive it is copied into a [`SampleBuffer`] by the [`BufferConverter`].
//! Output always keeps the input representation: there is no resampling,
//! channel remapping or sample format negotiation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AudioFormatDescriptor, ConversionError, SampleFormat};

/// One raw buffer of an engine's buffer list.
///
/// Holds `number_channels` interleaved channels of native-endian samples, or
/// `None` when the engine could not provide data for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBuffer {
    number_channels: u32,
    data: Option<Vec<u8>>,
}

impl RawBuffer {
    pub fn new(number_channels: u32, data: Vec<u8>) -> Self {
        Self {
            number_channels,
            data: Some(data),
        }
    }

    /// A buffer slot whose data pointer is missing.
    pub fn unavailable(number_channels: u32) -> Self {
        Self {
            number_channels,
            data: None,
        }
    }

    /// Encodes typed samples into a new buffer.
    pub fn from_samples<T: NativeSample>(number_channels: u32, samples: &[T]) -> Self {
        let mut buffer = Self::new(number_channels, Vec::new());
        buffer.write_samples(samples.iter().copied());
        buffer
    }

    /// Replaces the buffer contents, reusing the existing allocation.
    pub fn write_samples<T: NativeSample>(&mut self, samples: impl IntoIterator<Item = T>) {
        let data = self.data.get_or_insert_with(Vec::new);
        data.clear();
        for sample in samples {
            sample.write_ne(data);
        }
    }

    pub fn number_channels(&self) -> u32 {
        self.number_channels
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }
}

/// Sample types that can be stored in a [`RawBuffer`].
pub trait NativeSample: Copy {
    fn write_ne(self, out: &mut Vec<u8>);
}

impl NativeSample for f32 {
    fn write_ne(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_ne_bytes());
    }
}

impl NativeSample for i16 {
    fn write_ne(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_ne_bytes());
    }
}

impl NativeSample for i32 {
    fn write_ne(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_ne_bytes());
    }
}

/// Borrowed view over the buffers an engine filled for one process call.
#[derive(Debug, Clone, Copy)]
pub struct NativeFrame<'a> {
    buffers: &'a [RawBuffer],
    frame_count: usize,
}

impl<'a> NativeFrame<'a> {
    pub fn new(buffers: &'a [RawBuffer], frame_count: usize) -> Self {
        Self {
            buffers,
            frame_count,
        }
    }

    pub fn buffers(&self) -> &'a [RawBuffer] {
        self.buffers
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }
}

/// Typed storage of one [`SampleBuffer`] region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SampleData {
    F32(Vec<f32>),
    I16(Vec<i16>),
    I32(Vec<i32>),
}

impl SampleData {
    fn empty(format: SampleFormat) -> Option<Self> {
        match format {
            SampleFormat::F32 => Some(SampleData::F32(Vec::new())),
            SampleFormat::I16 => Some(SampleData::I16(Vec::new())),
            SampleFormat::I32 => Some(SampleData::I32(Vec::new())),
            SampleFormat::Unsupported { .. } => None,
        }
    }

    pub fn sample_format(&self) -> SampleFormat {
        match self {
            SampleData::F32(_) => SampleFormat::F32,
            SampleData::I16(_) => SampleFormat::I16,
            SampleData::I32(_) => SampleFormat::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SampleData::F32(v) => v.len(),
            SampleData::I16(v) => v.len(),
            SampleData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `index` normalised to `[-1, 1]`.
    pub fn normalized(&self, index: usize) -> f32 {
        match self {
            SampleData::F32(v) => v[index],
            SampleData::I16(v) => v[index] as f32 / 32_768.0,
            SampleData::I32(v) => (v[index] as f64 / 2_147_483_648.0) as f32,
        }
    }

    fn clear(&mut self) {
        match self {
            SampleData::F32(v) => v.clear(),
            SampleData::I16(v) => v.clear(),
            SampleData::I32(v) => v.clear(),
        }
    }

    fn extend_from_bytes(&mut self, bytes: &[u8]) {
        match self {
            SampleData::F32(v) => v.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
            ),
            SampleData::I16(v) => {
                v.extend(bytes.chunks_exact(2).map(|c| i16::from_ne_bytes([c[0], c[1]])))
            }
            SampleData::I32(v) => v.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
            ),
        }
    }

    fn extend_silence(&mut self, count: usize) {
        match self {
            SampleData::F32(v) => v.resize(v.len() + count, 0.0),
            SampleData::I16(v) => v.resize(v.len() + count, 0),
            SampleData::I32(v) => v.resize(v.len() + count, 0),
        }
    }
}

/// Owned, uniform audio chunk produced by the [`BufferConverter`].
///
/// Interleaved input yields a single region of `frame_count * channels`
/// samples; non-interleaved input yields one region of `frame_count` samples
/// per channel. Buffers are only built by the converter, which keeps every
/// region sized to the frame count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleBuffer {
    sample_rate: f64,
    channels: usize,
    frame_count: usize,
    sample_format: SampleFormat,
    interleaved: bool,
    regions: Vec<SampleData>,
}

impl SampleBuffer {
    /// Creates an empty buffer that can be filled with
    /// [`BufferConverter::convert_into`].
    pub fn empty() -> Self {
        Self {
            sample_rate: 0.0,
            channels: 0,
            frame_count: 0,
            sample_format: SampleFormat::F32,
            interleaved: false,
            regions: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleaved
    }

    pub fn regions(&self) -> &[SampleData] {
        &self.regions
    }

    pub fn region(&self, index: usize) -> Option<&SampleData> {
        self.regions.get(index)
    }

    /// Total element count across all regions.
    pub fn total_samples(&self) -> usize {
        self.regions.iter().map(SampleData::len).sum()
    }

    /// Writes one channel, normalised to `f32`, into `out`.
    pub fn channel_f32(&self, channel: usize, out: &mut Vec<f32>) {
        out.clear();
        if channel >= self.channels {
            return;
        }

        if self.interleaved {
            if let Some(region) = self.regions.first() {
                let frames = self.frame_count.min(region.len() / self.channels);
                out.extend(
                    (0..frames).map(|frame| region.normalized(frame * self.channels + channel)),
                );
            }
        } else if let Some(region) = self.regions.get(channel) {
            out.extend((0..region.len()).map(|index| region.normalized(index)));
        }
    }

    /// Averages all channels into `out`.
    pub fn mix_mono_f32(&self, out: &mut Vec<f32>) {
        out.clear();
        out.resize(self.frame_count, 0.0);
        if self.channels == 0 {
            return;
        }

        let scale = 1.0 / self.channels as f32;
        if self.interleaved {
            if let Some(region) = self.regions.first() {
                let frames = region.len() / self.channels;
                for (frame, value) in out.iter_mut().enumerate().take(frames) {
                    let base = frame * self.channels;
                    let sum: f32 = (0..self.channels)
                        .map(|channel| region.normalized(base + channel))
                        .sum();
                    *value = sum * scale;
                }
            }
        } else {
            for region in &self.regions {
                for (index, value) in out.iter_mut().enumerate().take(region.len()) {
                    *value += region.normalized(index) * scale;
                }
            }
        }
    }

    fn reset(&mut self, format: &AudioFormatDescriptor, frame_count: usize, regions: usize) {
        self.sample_rate = format.sample_rate();
        self.channels = format.channels();
        self.frame_count = frame_count;
        self.sample_format = format.sample_format();
        self.interleaved = format.is_interleaved();

        self.regions.truncate(regions);
        for region in &mut self.regions {
            if region.sample_format() == self.sample_format {
                region.clear();
            } else if let Some(fresh) = SampleData::empty(self.sample_format) {
                *region = fresh;
            }
        }
        while self.regions.len() < regions {
            match SampleData::empty(self.sample_format) {
                Some(region) => self.regions.push(region),
                None => break,
            }
        }
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

/// What to do with a non-interleaved channel whose source data is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingChannelPolicy {
    /// Emit silence for the channel and keep the rest of the buffer.
    #[default]
    ZeroFill,
    /// Reject the whole buffer with [`ConversionError::SourceUnavailable`].
    Fail,
}

/// Converts [`NativeFrame`]s into [`SampleBuffer`]s.
///
/// Validation happens before any sample is written, so a failed conversion
/// never leaves a partially converted buffer behind. An interleaved buffer
/// with no data is always `SourceUnavailable`, since there is no single
/// channel to substitute; the [`MissingChannelPolicy`] only governs
/// non-interleaved channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferConverter {
    missing_channel: MissingChannelPolicy,
}

impl BufferConverter {
    pub fn new(missing_channel: MissingChannelPolicy) -> Self {
        Self { missing_channel }
    }

    /// Converts `frame_count` frames of `frame` into a freshly allocated buffer.
    pub fn convert(
        &self,
        frame: &NativeFrame<'_>,
        format: &AudioFormatDescriptor,
        frame_count: usize,
    ) -> Result<SampleBuffer, ConversionError> {
        let mut buffer = SampleBuffer::empty();
        self.convert_into(frame, format, frame_count, &mut buffer)?;
        Ok(buffer)
    }

    /// Converts into `out`, reusing its region allocations.
    ///
    /// On error `out` is left untouched.
    pub fn convert_into(
        &self,
        frame: &NativeFrame<'_>,
        format: &AudioFormatDescriptor,
        frame_count: usize,
        out: &mut SampleBuffer,
    ) -> Result<(), ConversionError> {
        let sample_format = format.sample_format();
        let bytes_per_sample = sample_format
            .bytes_per_sample()
            .ok_or(ConversionError::UnsupportedFormat(sample_format))?;

        if frame_count > frame.frame_count() {
            return Err(ConversionError::FormatMismatch {
                what: "frames",
                expected: frame_count,
                found: frame.frame_count(),
            });
        }

        let channels = format.channels();
        let buffers = frame.buffers();

        if format.is_interleaved() {
            if buffers.len() != 1 {
                return Err(ConversionError::FormatMismatch {
                    what: "interleaved buffers",
                    expected: 1,
                    found: buffers.len(),
                });
            }

            let source = &buffers[0];
            if source.number_channels() as usize != channels {
                return Err(ConversionError::FormatMismatch {
                    what: "interleaved channels",
                    expected: channels,
                    found: source.number_channels() as usize,
                });
            }

            let data = source
                .data()
                .ok_or(ConversionError::SourceUnavailable { channel: 0 })?;
            let needed = byte_len(frame_count, channels * bytes_per_sample)?;
            let bytes = source_bytes(data, needed)?;

            out.reset(format, frame_count, 1);
            out.regions[0].extend_from_bytes(bytes);
            return Ok(());
        }

        if buffers.len() != channels {
            return Err(ConversionError::FormatMismatch {
                what: "channel buffers",
                expected: channels,
                found: buffers.len(),
            });
        }

        let needed = byte_len(frame_count, bytes_per_sample)?;
        for (channel, source) in buffers.iter().enumerate() {
            if source.number_channels() != 1 {
                return Err(ConversionError::FormatMismatch {
                    what: "channels per buffer",
                    expected: 1,
                    found: source.number_channels() as usize,
                });
            }
            match source.data() {
                Some(data) => {
                    source_bytes(data, needed)?;
                }
                None if self.missing_channel == MissingChannelPolicy::Fail => {
                    return Err(ConversionError::SourceUnavailable { channel });
                }
                None => {}
            }
        }

        out.reset(format, frame_count, channels);
        for (channel, (source, region)) in buffers.iter().zip(out.regions.iter_mut()).enumerate() {
            match source.data() {
                Some(data) => region.extend_from_bytes(&data[..needed]),
                None => {
                    debug!(channel, "channel source unavailable, substituting silence");
                    region.extend_silence(frame_count);
                }
            }
        }

        Ok(())
    }
}

/// Bytes needed for `frame_count` frames of `frame_bytes` each.
fn byte_len(frame_count: usize, frame_bytes: usize) -> Result<usize, ConversionError> {
    frame_count
        .checked_mul(frame_bytes)
        .ok_or(ConversionError::FormatMismatch {
            what: "frame count",
            expected: usize::MAX / frame_bytes.max(1),
            found: frame_count,
        })
}

fn source_bytes(data: &[u8], needed: usize) -> Result<&[u8], ConversionError> {
    if data.len() < needed {
        return Err(ConversionError::FormatMismatch {
            what: "source bytes",
            expected: needed,
            found: data.len(),
        });
    }
    Ok(&data[..needed])
}
