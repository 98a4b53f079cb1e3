//! PCM buffers and WAV encoding/decoding.
//!
//! Samples are kept as interleaved `f32` in `[-1.0, 1.0]` regardless of the
//! source bit depth; encoding always produces 16-bit integer PCM.

use std::io::Cursor;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("audio contains no samples")]
    Empty,

    #[error("resample error: {0}")]
    Resample(String),

    #[error("format mismatch: expected {expected_rate} Hz/{expected_channels} ch, found {found_rate} Hz/{found_channels} ch")]
    FormatMismatch {
        expected_rate: u32,
        expected_channels: u16,
        found_rate: u32,
        found_channels: u16,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PcmAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl PcmAudio {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels,
            samples,
        }
    }

    pub fn empty(sample_rate: u32, channels: u16) -> Self {
        Self::new(sample_rate, channels, Vec::new())
    }

    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        frames_to_secs(self.frames(), self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn same_format(&self, other: &PcmAudio) -> Result<(), AudioError> {
        if self.sample_rate == other.sample_rate && self.channels == other.channels {
            Ok(())
        } else {
            Err(AudioError::FormatMismatch {
                expected_rate: self.sample_rate,
                expected_channels: self.channels,
                found_rate: other.sample_rate,
                found_channels: other.channels,
            })
        }
    }

    /// Number of frames covering `ms`, clamped to half the buffer so that a
    /// fade-in and fade-out on the same chunk never overlap.
    fn fade_frames(&self, ms: u32) -> usize {
        let wanted = (self.sample_rate as u64 * ms as u64 / 1000) as usize;
        wanted.min(self.frames() / 2)
    }

    /// Linear ramp from silence over the first `ms` milliseconds.
    pub fn fade_in(&mut self, ms: u32) {
        let n = self.fade_frames(ms);
        let ch = self.channels as usize;
        for frame in 0..n {
            let gain = frame as f32 / n as f32;
            for s in &mut self.samples[frame * ch..(frame + 1) * ch] {
                *s *= gain;
            }
        }
    }

    /// Linear ramp to silence over the last `ms` milliseconds.
    pub fn fade_out(&mut self, ms: u32) {
        let n = self.fade_frames(ms);
        let ch = self.channels as usize;
        let frames = self.frames();
        for i in 0..n {
            let frame = frames - n + i;
            let gain = (n - 1 - i) as f32 / n as f32;
            for s in &mut self.samples[frame * ch..(frame + 1) * ch] {
                *s *= gain;
            }
        }
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    /// Scale so the loudest sample sits at `target_dbfs`. Silence is left alone.
    pub fn normalize_peak(&mut self, target_dbfs: f32) {
        let peak = self.peak();
        if peak <= f32::EPSILON {
            return;
        }
        let target = 10f32.powf(target_dbfs / 20.0);
        let gain = target / peak;
        for s in &mut self.samples {
            *s *= gain;
        }
    }

    pub fn append(&mut self, other: &PcmAudio) -> Result<(), AudioError> {
        self.same_format(other)?;
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }

    /// Convert to `sample_rate` and `channels`, keeping the duration.
    pub fn conform(&self, sample_rate: u32, channels: u16) -> Result<PcmAudio, AudioError> {
        self.remix(channels)?.resample(sample_rate)
    }

    /// Change the channel count. Downmixing to mono averages; any other
    /// layout change maps output channel `c` to input channel `c % from`.
    pub fn remix(&self, channels: u16) -> Result<PcmAudio, AudioError> {
        if channels == 0 || self.channels == 0 {
            return Err(AudioError::Resample("zero channels".into()));
        }
        if channels == self.channels {
            return Ok(self.clone());
        }
        let from = self.channels as usize;
        let to = channels as usize;
        let mut samples = Vec::with_capacity(self.frames() * to);
        for frame in self.samples.chunks_exact(from) {
            if to == 1 {
                samples.push(frame.iter().sum::<f32>() / from as f32);
            } else {
                samples.extend((0..to).map(|c| frame[c % from]));
            }
        }
        Ok(PcmAudio::new(self.sample_rate, channels, samples))
    }

    /// Band-limited sinc resampling. The output has exactly
    /// `round(frames · to / from)` frames with the filter delay removed, so
    /// durations and boundaries computed from frame counts stay exact.
    pub fn resample(&self, sample_rate: u32) -> Result<PcmAudio, AudioError> {
        use rubato::{
            Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
            WindowFunction,
        };

        if sample_rate == 0 || self.sample_rate == 0 {
            return Err(AudioError::Resample("zero sample rate".into()));
        }
        if sample_rate == self.sample_rate || self.is_empty() {
            return Ok(PcmAudio::new(sample_rate, self.channels, self.samples.clone()));
        }

        let ch = self.channels as usize;
        let ratio = f64::from(sample_rate) / f64::from(self.sample_rate);
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_BLOCK, ch)
            .map_err(|e| AudioError::Resample(e.to_string()))?;

        let planar: Vec<Vec<f32>> = (0..ch)
            .map(|c| self.samples.iter().skip(c).step_by(ch).copied().collect())
            .collect();
        let wanted = (self.frames() as f64 * ratio).round() as usize;
        let delay = resampler.output_delay();
        let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(delay + wanted + RESAMPLE_BLOCK); ch];

        // Past the end of the input the filter is fed silence until the
        // delayed tail has been flushed out.
        let mut pos = 0;
        while out[0].len() < delay + wanted {
            let block: Vec<Vec<f32>> = planar
                .iter()
                .map(|channel| {
                    let end = (pos + RESAMPLE_BLOCK).min(channel.len());
                    let mut block = channel.get(pos..end).unwrap_or_default().to_vec();
                    block.resize(RESAMPLE_BLOCK, 0.0);
                    block
                })
                .collect();
            let produced = resampler
                .process(&block, None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            if produced.first().map_or(true, |c| c.is_empty()) {
                return Err(AudioError::Resample("resampler produced no output".into()));
            }
            for (dst, src) in out.iter_mut().zip(produced) {
                dst.extend(src);
            }
            pos += RESAMPLE_BLOCK;
        }

        let mut samples = Vec::with_capacity(wanted * ch);
        for frame in delay..delay + wanted {
            samples.extend(out.iter().map(|channel| channel[frame]));
        }
        Ok(PcmAudio::new(sample_rate, self.channels, samples))
    }
}

const RESAMPLE_BLOCK: usize = 1024;

pub fn frames_to_secs(frames: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    frames as f64 / sample_rate as f64
}

/// Decode a WAV file held in memory.
pub fn decode_wav(bytes: &[u8]) -> Result<PcmAudio, AudioError> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| AudioError::Decode(e.to_string()))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(AudioError::Decode(format!(
            "invalid header: {} Hz, {} channels",
            spec.sample_rate, spec.channels
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::Decode(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::Decode(e.to_string()))?
        }
    };

    Ok(PcmAudio::new(spec.sample_rate, spec.channels, samples))
}

/// Header facts about a WAV file, read without decoding samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frames: u32,
}

impl WavInfo {
    pub fn duration_secs(&self) -> f64 {
        frames_to_secs(self.frames as usize, self.sample_rate)
    }
}

/// Validate a WAV header and require at least one frame of audio.
pub fn inspect_wav(bytes: &[u8]) -> Result<WavInfo, AudioError> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| AudioError::Decode(e.to_string()))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(AudioError::Decode(format!(
            "invalid header: {} Hz, {} channels",
            spec.sample_rate, spec.channels
        )));
    }
    let frames = reader.duration();
    if frames == 0 {
        return Err(AudioError::Empty);
    }
    Ok(WavInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        frames,
    })
}

/// Encode as 16-bit integer PCM WAV.
pub fn encode_wav(audio: &PcmAudio) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buf = Cursor::new(Vec::<u8>::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut buf, spec).map_err(|e| AudioError::Encode(e.to_string()))?;
        for &s in &audio.samples {
            writer
                .write_sample(to_pcm16(s))
                .map_err(|e| AudioError::Encode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| AudioError::Encode(e.to_string()))?;
    }
    Ok(buf.into_inner())
}

fn to_pcm16(x: f32) -> i16 {
    let x = x.clamp(-1.0, 1.0);
    if x >= 0.0 {
        (x * 32767.0).round() as i16
    } else {
        (x * 32768.0).round() as i16
    }
}
