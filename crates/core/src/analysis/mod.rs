use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{AnalyzerConfig, Result, SampleBuffer, TapScopeError};

/// Per-channel magnitude bins computed from one [`SampleBuffer`].
///
/// Channels keep the order of the analysed buffer; bins within a channel are
/// ordered by ascending frequency and are never negative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumFrame {
    channels: Vec<Vec<f32>>,
}

impl SpectrumFrame {
    pub fn new(channels: Vec<Vec<f32>>) -> Self {
        Self { channels }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Contract for anything that turns converted audio into a spectrum.
///
/// Implementations are driven from the real-time tap callback only, one call
/// per converted buffer and never concurrently. Results are handed to the
/// coordination side through the delivery channel, so an analyzer does not
/// need to be shareable between threads beyond being `Send`.
pub trait SpectrumAnalyzer: Send {
    fn analyse(&mut self, buffer: &SampleBuffer) -> Result<SpectrumFrame>;
}

/// Windowed FFT analyzer producing normalised magnitudes.
///
/// Each call looks at the trailing `fft_size` frames of the buffer (zero
/// padded at the front when the buffer is shorter). A full-scale sine that
/// lands on a bin centre reports a magnitude close to `1.0`.
pub struct FftAnalyzer {
    config: AnalyzerConfig,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
    samples: Vec<f32>,
}

impl FftAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config: AnalyzerConfig {
                fft_size: config.fft_size.max(2),
                ..config
            },
            fft_planner: RealFftPlanner::new(),
            fft: None,
            samples: Vec::new(),
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn prepare_fft(&mut self) {
        let size = self.config.fft_size;
        let rebuild = self
            .fft
            .as_ref()
            .map(|fft| fft.size != size)
            .unwrap_or(true);

        if rebuild {
            let plan = self.fft_planner.plan_fft_forward(size);
            let scratch = plan.make_scratch_vec();
            let spectrum = plan.make_output_vec();
            let input = plan.make_input_vec();
            self.fft = Some(FftResources {
                size,
                plan,
                scratch,
                spectrum,
                input,
            });
        }
    }

    fn spectrum_of_samples(&mut self) -> Result<Vec<f32>> {
        self.prepare_fft();
        let bands = self.config.bands;
        let fft = self
            .fft
            .as_mut()
            .ok_or_else(|| TapScopeError::Analysis("fft resources missing".to_string()))?;

        let size = fft.size;
        let tail = &self.samples[self.samples.len().saturating_sub(size)..];
        let offset = size - tail.len();

        fft.input[..offset].fill(0.0);
        for (index, value) in tail.iter().enumerate() {
            let position = offset + index;
            fft.input[position] = *value * hann_value(position, size);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| TapScopeError::Analysis(err.to_string()))?;

        // Hann coherent gain is 0.5 and the spectrum is single sided.
        let scale = 4.0 / size as f32;
        let magnitudes: Vec<f32> = fft.spectrum.iter().map(|bin| bin.norm() * scale).collect();

        Ok(group_bands(&magnitudes, bands))
    }
}

impl SpectrumAnalyzer for FftAnalyzer {
    fn analyse(&mut self, buffer: &SampleBuffer) -> Result<SpectrumFrame> {
        if buffer.channel_count() == 0 || buffer.frame_count() == 0 {
            return Ok(SpectrumFrame::default());
        }

        let sources = if self.config.mono {
            1
        } else {
            buffer.channel_count()
        };

        let mut channels = Vec::with_capacity(sources);
        for channel in 0..sources {
            if self.config.mono {
                buffer.mix_mono_f32(&mut self.samples);
            } else {
                buffer.channel_f32(channel, &mut self.samples);
            }
            channels.push(self.spectrum_of_samples()?);
        }

        Ok(SpectrumFrame::new(channels))
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for FftAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftAnalyzer")
            .field("config", &self.config)
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

/// Collapses linear bins into `bands` logarithmically spaced bands, keeping
/// the peak of each band. `0` or a band count that is not smaller than the
/// bin count returns the bins unchanged. The DC bin is skipped when grouping.
fn group_bands(magnitudes: &[f32], bands: usize) -> Vec<f32> {
    let bins = magnitudes.len();
    if bands == 0 || bands >= bins {
        return magnitudes.to_vec();
    }

    let edge = |band: usize| (bins as f32).powf(band as f32 / bands as f32) as usize;

    (0..bands)
        .map(|band| {
            let start = edge(band).clamp(1, bins - 1);
            let end = edge(band + 1).clamp(start + 1, bins);
            magnitudes[start..end].iter().copied().fold(0.0, f32::max)
        })
        .collect()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioFormatDescriptor, BufferConverter, NativeFrame, RawBuffer, SampleFormat};

    fn analyzer(fft_size: usize, mono: bool, bands: usize) -> FftAnalyzer {
        FftAnalyzer::new(AnalyzerConfig {
            fft_size,
            mono,
            bands,
        })
    }

    fn buffer_from_channels(channels: &[Vec<f32>]) -> SampleBuffer {
        let format =
            AudioFormatDescriptor::new(48_000.0, channels.len(), SampleFormat::F32, false)
                .unwrap();
        let buffers: Vec<RawBuffer> = channels
            .iter()
            .map(|samples| RawBuffer::from_samples(1, samples))
            .collect();
        let frames = channels[0].len();

        BufferConverter::default()
            .convert(&NativeFrame::new(&buffers, frames), &format, frames)
            .unwrap()
    }

    fn sine(bin: usize, size: usize, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| (2.0 * PI * bin as f32 * n as f32 / size as f32).sin())
            .collect()
    }

    #[test]
    fn silence_produces_zero_magnitudes() {
        let mut analyzer = analyzer(256, true, 0);
        let frame = analyzer
            .analyse(&buffer_from_channels(&[vec![0.0; 256], vec![0.0; 256]]))
            .unwrap();

        assert_eq!(frame.channel_count(), 1);
        assert_eq!(frame.channel(0).unwrap().len(), 129);
        assert!(frame.channel(0).unwrap().iter().all(|m| *m == 0.0));
    }

    #[test]
    fn full_scale_sine_peaks_at_its_bin() {
        let mut analyzer = analyzer(1024, false, 0);
        let frame = analyzer
            .analyse(&buffer_from_channels(&[sine(64, 1024, 1024)]))
            .unwrap();

        let bins = frame.channel(0).unwrap();
        let (peak_bin, peak) = bins
            .iter()
            .enumerate()
            .fold((0, 0.0_f32), |best, (i, m)| if *m > best.1 { (i, *m) } else { best });

        assert_eq!(peak_bin, 64);
        assert!((peak - 1.0).abs() < 0.05, "peak magnitude {peak}");
    }

    #[test]
    fn keeps_one_sequence_per_channel_in_order() {
        let mut analyzer = analyzer(512, false, 0);
        let frame = analyzer
            .analyse(&buffer_from_channels(&[sine(8, 512, 512), vec![0.0; 512]]))
            .unwrap();

        assert_eq!(frame.channel_count(), 2);
        assert!(frame.channel(0).unwrap()[8] > 0.5);
        assert!(frame.channel(1).unwrap().iter().all(|m| *m == 0.0));
    }

    #[test]
    fn short_buffers_are_zero_padded() {
        let mut analyzer = analyzer(2048, true, 32);
        let frame = analyzer
            .analyse(&buffer_from_channels(&[sine(100, 2048, 300)]))
            .unwrap();

        let bands = frame.channel(0).unwrap();
        assert_eq!(bands.len(), 32);
        assert!(bands.iter().all(|m| *m >= 0.0));
        assert!(bands.iter().any(|m| *m > 0.0));
    }

    #[test]
    fn band_grouping_keeps_frequency_order() {
        let bins: Vec<f32> = (0..129).map(|i| i as f32).collect();
        let bands = group_bands(&bins, 8);

        assert_eq!(bands.len(), 8);
        assert!(bands.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(group_bands(&bins, 0).len(), 129);
    }

    #[test]
    fn empty_buffers_yield_empty_frames() {
        let mut analyzer = analyzer(256, true, 16);
        let frame = analyzer.analyse(&SampleBuffer::empty()).unwrap();
        assert!(frame.is_empty());
    }
}
