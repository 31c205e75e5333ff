use serde::{Deserialize, Serialize};

use crate::{Result, TapScopeError};

/// Sample representation of a PCM stream.
///
/// Only [`F32`](SampleFormat::F32), [`I16`](SampleFormat::I16) and
/// [`I32`](SampleFormat::I32) can be converted. Other layouts reported by an
/// engine are carried as [`Unsupported`](SampleFormat::Unsupported) so the
/// converter can reject them per buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    F32,
    I16,
    I32,
    Unsupported { bits_per_sample: u32, float: bool },
}

impl SampleFormat {
    /// Maps a bit depth and float flag onto a sample representation.
    pub fn from_bits(bits_per_sample: u32, float: bool) -> Self {
        match (bits_per_sample, float) {
            (32, true) => SampleFormat::F32,
            (16, false) => SampleFormat::I16,
            (32, false) => SampleFormat::I32,
            _ => SampleFormat::Unsupported {
                bits_per_sample,
                float,
            },
        }
    }

    /// Size in bytes of a single sample, `None` for unsupported formats.
    pub fn bytes_per_sample(self) -> Option<usize> {
        match self {
            SampleFormat::F32 | SampleFormat::I32 => Some(4),
            SampleFormat::I16 => Some(2),
            SampleFormat::Unsupported { .. } => None,
        }
    }

    pub fn is_supported(self) -> bool {
        self.bytes_per_sample().is_some()
    }
}

/// Immutable description of the tapped stream, captured once per session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormatDescriptor {
    sample_rate: f64,
    channels: usize,
    sample_format: SampleFormat,
    interleaved: bool,
}

impl AudioFormatDescriptor {
    /// Builds a descriptor, rejecting non-positive rates and zero channels.
    pub fn new(
        sample_rate: f64,
        channels: usize,
        sample_format: SampleFormat,
        interleaved: bool,
    ) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(TapScopeError::FormatUnresolvable(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        if channels == 0 {
            return Err(TapScopeError::FormatUnresolvable(
                "stream reports zero channels".to_string(),
            ));
        }

        Ok(Self {
            sample_rate,
            channels,
            sample_format,
            interleaved,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleaved
    }
}

/// Raw stream description as reported by a media engine for an audio track.
///
/// Mirrors the fields a Core Audio style basic description carries; it is
/// resolved into an [`AudioFormatDescriptor`] before a tap is installed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub sample_rate: f64,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
    pub is_float: bool,
    pub is_non_interleaved: bool,
}

impl StreamDescription {
    /// Describes a linear PCM stream with the given representation.
    pub fn linear_pcm(
        sample_rate: f64,
        channels: u32,
        sample_format: SampleFormat,
        interleaved: bool,
    ) -> Self {
        let (bits_per_channel, is_float) = match sample_format {
            SampleFormat::F32 => (32, true),
            SampleFormat::I16 => (16, false),
            SampleFormat::I32 => (32, false),
            SampleFormat::Unsupported {
                bits_per_sample,
                float,
            } => (bits_per_sample, float),
        };

        Self {
            sample_rate,
            channels_per_frame: channels,
            bits_per_channel,
            is_float,
            is_non_interleaved: !interleaved,
        }
    }

    /// Resolves the description into a descriptor.
    ///
    /// A zero bit depth is treated as an opaque (compressed) stream and is
    /// unresolvable; an unknown but non-zero PCM layout resolves to
    /// [`SampleFormat::Unsupported`].
    pub fn resolve(&self) -> Result<AudioFormatDescriptor> {
        if self.bits_per_channel == 0 {
            return Err(TapScopeError::FormatUnresolvable(
                "stream description has no PCM bit depth".to_string(),
            ));
        }

        AudioFormatDescriptor::new(
            self.sample_rate,
            self.channels_per_frame as usize,
            SampleFormat::from_bits(self.bits_per_channel, self.is_float),
            !self.is_non_interleaved,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_linear_pcm_descriptions() {
        let description = StreamDescription::linear_pcm(48_000.0, 2, SampleFormat::I16, true);
        let format = description.resolve().unwrap();

        assert_eq!(format.channels(), 2);
        assert_eq!(format.sample_format(), SampleFormat::I16);
        assert!(format.is_interleaved());
        assert_eq!(format.sample_rate(), 48_000.0);
    }

    #[test]
    fn unknown_layouts_resolve_as_unsupported() {
        let description = StreamDescription {
            sample_rate: 44_100.0,
            channels_per_frame: 2,
            bits_per_channel: 24,
            is_float: false,
            is_non_interleaved: true,
        };
        let format = description.resolve().unwrap();

        assert!(!format.sample_format().is_supported());
    }

    #[test]
    fn rejects_unresolvable_descriptions() {
        let compressed = StreamDescription {
            sample_rate: 44_100.0,
            channels_per_frame: 2,
            bits_per_channel: 0,
            is_float: false,
            is_non_interleaved: false,
        };
        assert!(matches!(
            compressed.resolve(),
            Err(TapScopeError::FormatUnresolvable(_))
        ));

        let silent = StreamDescription::linear_pcm(0.0, 2, SampleFormat::F32, true);
        assert!(silent.resolve().is_err());

        let empty = StreamDescription::linear_pcm(48_000.0, 0, SampleFormat::F32, true);
        assert!(empty.resolve().is_err());
    }
}
