use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WavError {
    #[error("WAV error: {0}")]
    Hound(#[from] hound::Error),
    #[error("WAV file has zero channels or zero sample rate")]
    InvalidSpec,
}

/// Mono PCM audio held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn duration_ms(&self) -> i64 {
        (self.duration_secs() * 1000.0) as i64
    }
}

/// Interleaved samples plus the header they came from.
pub struct DecodedWav {
    pub spec: WavSpec,
    pub interleaved: Vec<f32>,
}

/// Decode any PCM/float WAV into interleaved f32 in [-1, 1].
pub fn decode_wav(path: &Path) -> Result<DecodedWav, WavError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(WavError::InvalidSpec);
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<_, _>>()?
        }
    };

    Ok(DecodedWav { spec, interleaved })
}

/// Average interleaved channels down to one.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let ch = channels as usize;
    interleaved
        .chunks(ch)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Read a WAV file as a mono waveform at its native rate.
pub fn read_wav(path: &Path) -> Result<Waveform, WavError> {
    let decoded = decode_wav(path)?;
    let samples = downmix(&decoded.interleaved, decoded.spec.channels);
    Ok(Waveform::new(samples, decoded.spec.sample_rate))
}

fn float_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// Write a mono waveform as 32-bit float WAV.
pub fn write_wav(path: &Path, waveform: &Waveform) -> Result<(), WavError> {
    let mut writer = WavWriter::create(path, float_spec(waveform.sample_rate))?;
    for s in &waveform.samples {
        writer.write_sample(*s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Encode a mono waveform as a 32-bit float WAV byte buffer.
pub fn encode_wav(waveform: &Waveform) -> Result<Vec<u8>, WavError> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, float_spec(waveform.sample_rate))?;
        for s in &waveform.samples {
            writer.write_sample(*s)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Peak preview for waveform rendering: the max |sample| of each of (at most)
/// `windows` equal windows, scaled to i16 and packed little-endian.
pub fn peak_preview(samples: &[f32], windows: usize) -> Vec<u8> {
    if samples.is_empty() || windows == 0 {
        return Vec::new();
    }
    let step = (samples.len() / windows).max(1);

    samples
        .chunks(step)
        .take(windows)
        .map(|w| w.iter().fold(0.0f32, |m, s| m.max(s.abs())))
        .flat_map(|peak| ((peak * 32767.0) as i16).to_le_bytes())
        .collect()
}
