use crate::audio::{self, Waveform};
use std::io::ErrorKind as IoKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("transcoder binary not found: {0}")]
    BinaryMissing(String),
    #[error("input file not found: {0}")]
    InputMissing(PathBuf),
    #[error("cannot decode {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("cannot write normalized audio: {0}")]
    Output(#[from] audio::WavError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Canonical mono WAV produced by a transcoder.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAudio {
    pub wav_path: PathBuf,
    pub sample_rate: u32,
    pub duration_ms: i64,
}

/// Converts arbitrary input audio into mono WAV at a target rate.
pub trait Transcoder: Send + Sync {
    fn normalize(
        &self,
        input: &Path,
        target_sample_rate: u32,
        output: &Path,
    ) -> Result<NormalizedAudio, TranscodeError>;
}

/// Shells out to ffmpeg. Handles anything ffmpeg can decode.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    pub bin: String,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self { bin: "ffmpeg".into() }
    }
}

impl Transcoder for FfmpegTranscoder {
    fn normalize(
        &self,
        input: &Path,
        target_sample_rate: u32,
        output: &Path,
    ) -> Result<NormalizedAudio, TranscodeError> {
        if !input.is_file() {
            return Err(TranscodeError::InputMissing(input.to_path_buf()));
        }

        let rate = target_sample_rate.to_string();
        let result = Command::new(&self.bin)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(input)
            .args(["-ac", "1", "-ar", &rate, "-acodec", "pcm_s16le", "-f", "wav"])
            .arg(output)
            .output();

        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == IoKind::NotFound => {
                return Err(TranscodeError::BinaryMissing(self.bin.clone()));
            }
            Err(e) => return Err(TranscodeError::Io(e)),
        };

        if !out.status.success() {
            std::fs::remove_file(output).ok();
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(TranscodeError::Unreadable {
                path: input.to_path_buf(),
                reason: stderr.trim().to_string(),
            });
        }

        // ffmpeg picks the header; read it back rather than trusting the request
        let reader = hound::WavReader::open(output).map_err(|e| TranscodeError::Unreadable {
            path: output.to_path_buf(),
            reason: e.to_string(),
        })?;
        let spec = reader.spec();
        let duration_ms = if spec.sample_rate == 0 {
            0
        } else {
            reader.duration() as i64 * 1000 / spec.sample_rate as i64
        };

        Ok(NormalizedAudio {
            wav_path: output.to_path_buf(),
            sample_rate: spec.sample_rate,
            duration_ms,
        })
    }
}

/// WAV-only transcoder with no external binary: downmix plus linear resampling.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTranscoder;

impl Transcoder for NativeTranscoder {
    fn normalize(
        &self,
        input: &Path,
        target_sample_rate: u32,
        output: &Path,
    ) -> Result<NormalizedAudio, TranscodeError> {
        if !input.is_file() {
            return Err(TranscodeError::InputMissing(input.to_path_buf()));
        }

        let decoded = audio::decode_wav(input).map_err(|e| TranscodeError::Unreadable {
            path: input.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mono = audio::downmix(&decoded.interleaved, decoded.spec.channels);
        let samples = resample_linear(&mono, decoded.spec.sample_rate, target_sample_rate);

        let waveform = Waveform::new(samples, target_sample_rate);
        audio::write_wav(output, &waveform)?;

        Ok(NormalizedAudio {
            wav_path: output.to_path_buf(),
            sample_rate: target_sample_rate,
            duration_ms: waveform.duration_ms(),
        })
    }
}

/// Linear-interpolation resampler. Good enough for onset and tempo work.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let out_len = ((samples.len() as f64 / ratio).round() as usize).max(1);
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_linear(&samples, 44100, 22050);
        assert_eq!(out.len(), 50);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[10], 20.0);

        let up = resample_linear(&[0.0, 1.0], 1, 2);
        assert_eq!(up, vec![0.0, 0.5, 1.0, 1.0]);

        assert_eq!(resample_linear(&[0.5, 0.25], 8000, 8000), vec![0.5, 0.25]);
    }

    #[test]
    fn test_native_downmixes_and_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(&input, spec).unwrap();
        for _ in 0..44100 {
            w.write_sample(8192i16).unwrap();
            w.write_sample(8192i16).unwrap();
        }
        w.finalize().unwrap();

        let output = dir.path().join("out.wav");
        let norm = NativeTranscoder.normalize(&input, 22050, &output).unwrap();
        assert_eq!(norm.sample_rate, 22050);
        assert_eq!(norm.duration_ms, 1000);

        let wave = audio::read_wav(&output).unwrap();
        assert_eq!(wave.sample_rate, 22050);
        assert_eq!(wave.samples.len(), 22050);
        assert!(wave.samples.iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_missing_and_unreadable_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.wav");

        let missing = NativeTranscoder.normalize(&dir.path().join("nope.wav"), 22050, &output);
        assert!(matches!(missing, Err(TranscodeError::InputMissing(_))));

        let garbage = dir.path().join("garbage.wav");
        std::fs::write(&garbage, b"definitely not audio").unwrap();
        let unreadable = NativeTranscoder.normalize(&garbage, 22050, &output);
        assert!(matches!(unreadable, Err(TranscodeError::Unreadable { .. })));
    }

    #[test]
    fn test_ffmpeg_binary_missing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        std::fs::write(&input, b"RIFF").unwrap();

        let transcoder = FfmpegTranscoder {
            bin: "beatgrid-no-such-ffmpeg".into(),
        };
        let result = transcoder.normalize(&input, 22050, &dir.path().join("out.wav"));
        assert!(matches!(result, Err(TranscodeError::BinaryMissing(_))));
    }
}
