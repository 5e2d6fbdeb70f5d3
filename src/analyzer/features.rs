//! Feature extraction port: tempo, beats, onsets and the onset-strength envelope.
//!
//! The pipeline only depends on [`FeatureExtractor`]. [`EnergyFluxExtractor`] is the
//! built-in implementation: a log-energy flux novelty curve, peak-picked onsets, an
//! autocorrelation tempo estimate and a beat grid refined against the envelope.

use crate::audio::Waveform;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("waveform has zero sample rate")]
    InvalidSampleRate,
    #[error("feature extraction failed: {0}")]
    Engine(String),
    #[error("{times} onset times but {strengths} onset strengths")]
    OnsetMismatch { times: usize, strengths: usize },
}

/// Onset-strength envelope with its time axis (seconds). Both vectors have equal length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnsetEnvelope {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl OnsetEnvelope {
    pub fn len(&self) -> usize {
        self.times.len().min(self.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the pipeline needs from one extraction call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeatAnalysis {
    pub tempo_bpm: f64,
    /// Strictly increasing, seconds.
    pub beat_times: Vec<f64>,
    /// Increasing, seconds; parallel to `onset_strengths`.
    pub onset_times: Vec<f64>,
    pub onset_strengths: Vec<f64>,
    pub envelope: OnsetEnvelope,
}

/// Must be deterministic for a given waveform.
pub trait FeatureExtractor: Send + Sync {
    fn analyze_beats(&self, waveform: &Waveform) -> Result<BeatAnalysis, FeatureError>;
}

/// Native tempo/beat/onset detector.
#[derive(Debug, Clone)]
pub struct EnergyFluxExtractor {
    pub hop: usize,
    pub frame: usize,
    pub min_bpm: f64,
    pub max_bpm: f64,
    /// Peaks must exceed mean + `threshold` * std of the envelope.
    pub threshold: f64,
    /// Minimum spacing between onsets, seconds.
    pub min_onset_gap: f64,
}

impl Default for EnergyFluxExtractor {
    fn default() -> Self {
        Self {
            hop: 512,
            frame: 1024,
            min_bpm: 60.0,
            max_bpm: 200.0,
            threshold: 0.5,
            min_onset_gap: 0.05,
        }
    }
}

impl FeatureExtractor for EnergyFluxExtractor {
    fn analyze_beats(&self, waveform: &Waveform) -> Result<BeatAnalysis, FeatureError> {
        if waveform.sample_rate == 0 {
            return Err(FeatureError::InvalidSampleRate);
        }
        if self.hop == 0 || self.frame == 0 {
            return Err(FeatureError::Engine("hop and frame sizes must be non-zero".into()));
        }

        let fps = waveform.sample_rate as f64 / self.hop as f64;
        let values = self.novelty(&waveform.samples);
        let times: Vec<f64> = (0..values.len()).map(|i| i as f64 / fps).collect();

        let peak_frames = self.pick_onsets(&values, fps);
        let onset_times = peak_frames.iter().map(|&i| times[i]).collect();
        let onset_strengths = peak_frames.iter().map(|&i| values[i]).collect();

        let (tempo_bpm, beat_frames) = match self.tempo_lag(&values, fps) {
            Some(lag) => (60.0 * fps / lag as f64, place_beats(&values, lag)),
            None => (0.0, Vec::new()),
        };
        let beat_times = beat_frames.iter().map(|&i| times[i]).collect();

        Ok(BeatAnalysis {
            tempo_bpm,
            beat_times,
            onset_times,
            onset_strengths,
            envelope: OnsetEnvelope { times, values },
        })
    }
}

impl EnergyFluxExtractor {
    /// Half-wave rectified first difference of per-frame log energy.
    fn novelty(&self, samples: &[f32]) -> Vec<f64> {
        if samples.is_empty() {
            return Vec::new();
        }
        let n_frames = samples.len().div_ceil(self.hop);

        let log_energy: Vec<f64> = (0..n_frames)
            .map(|i| {
                let start = i * self.hop;
                let end = (start + self.frame).min(samples.len());
                let energy: f64 = samples[start..end].iter().map(|s| (*s as f64).powi(2)).sum();
                (1.0 + 1000.0 * energy / self.frame as f64).ln()
            })
            .collect();

        let mut env = Vec::with_capacity(n_frames);
        env.push(0.0);
        for w in log_energy.windows(2) {
            env.push((w[1] - w[0]).max(0.0));
        }
        env
    }

    /// Local maxima above an adaptive threshold, at least `min_onset_gap` apart.
    fn pick_onsets(&self, env: &[f64], fps: f64) -> Vec<usize> {
        if env.len() < 3 {
            return Vec::new();
        }
        let n = env.len() as f64;
        let mean = env.iter().sum::<f64>() / n;
        let std = (env.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        let floor = mean + self.threshold * std;
        let min_gap = ((self.min_onset_gap * fps).ceil() as usize).max(1);

        let mut peaks: Vec<usize> = Vec::new();
        for i in 1..env.len() - 1 {
            let v = env[i];
            if v <= 0.0 || v <= floor || v < env[i - 1] || v <= env[i + 1] {
                continue;
            }
            if let Some(last) = peaks.last_mut() {
                if i - *last < min_gap {
                    if v > env[*last] {
                        *last = i;
                    }
                    continue;
                }
            }
            peaks.push(i);
        }
        peaks
    }

    /// Beat period in frames: the autocorrelation peak within the tempo range,
    /// weighted by a log-tempo prior so a double-period lag doesn't win on
    /// frame-quantized material.
    fn tempo_lag(&self, env: &[f64], fps: f64) -> Option<usize> {
        let min_lag = ((60.0 / self.max_bpm) * fps).round().max(1.0) as usize;
        let max_lag = ((60.0 / self.min_bpm) * fps).round() as usize;
        if env.len() < 2 * max_lag.max(min_lag) || env.iter().all(|v| *v <= 0.0) {
            return None;
        }

        // 3-tap smoothing lets peaks that land one frame apart still correlate
        let smoothed: Vec<f64> = (0..env.len())
            .map(|i| {
                let lo = i.saturating_sub(1);
                let hi = (i + 1).min(env.len() - 1);
                env[lo..=hi].iter().sum::<f64>() / (hi - lo + 1) as f64
            })
            .collect();
        let mean = smoothed.iter().sum::<f64>() / smoothed.len() as f64;
        let centered: Vec<f64> = smoothed.iter().map(|v| v - mean).collect();

        let mut best: Option<(usize, f64)> = None;
        for lag in min_lag..=max_lag {
            let ac: f64 = centered
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / (centered.len() - lag) as f64;
            if ac <= 0.0 {
                continue;
            }
            let bpm = 60.0 * fps / lag as f64;
            let score = ac * (-0.5 * (bpm / PRIOR_BPM).log2().powi(2)).exp();
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((lag, score));
            }
        }

        best.map(|(lag, _)| lag)
    }
}

/// Center of the tempo prior (one octave standard deviation).
const PRIOR_BPM: f64 = 120.0;

/// Start at the best-scoring grid offset, then walk forward one period at a time,
/// snapping each beat to the strongest envelope frame within a tenth of a period
/// of where the previous beat predicts it.
fn place_beats(env: &[f64], lag: usize) -> Vec<usize> {
    let offset = (0..lag)
        .map(|p| (p, env.iter().skip(p).step_by(lag).sum::<f64>()))
        .fold((0, f64::MIN), |best, cur| if cur.1 > best.1 { cur } else { best })
        .0;

    let radius = lag / 10;
    let mut beats = Vec::new();
    let mut center = offset;
    while center < env.len() {
        let lo = center.saturating_sub(radius);
        let hi = (center + radius).min(env.len() - 1);
        let beat = (lo..=hi).fold(center, |best, i| if env[i] > env[best] { i } else { best });
        // radius < lag, so each beat lands strictly after the previous one
        beats.push(beat);
        center = beat + lag;
    }
    beats
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 22050;

    /// Short noise-like bursts every `interval` seconds over silence.
    fn click_track(interval: f64, secs: f64) -> Waveform {
        let total = (secs * SR as f64) as usize;
        let mut samples = vec![0.0f32; total];
        let burst = (0.02 * SR as f64) as usize;
        let mut t = 0.0;
        while t < secs {
            let start = (t * SR as f64) as usize;
            for (k, s) in samples.iter_mut().skip(start).take(burst).enumerate() {
                *s = if k % 2 == 0 { 0.8 } else { -0.8 };
            }
            t += interval;
        }
        Waveform::new(samples, SR)
    }

    #[test]
    fn test_click_track_tempo() {
        let extractor = EnergyFluxExtractor::default();
        let result = extractor.analyze_beats(&click_track(0.5, 12.0)).unwrap();

        // Frame quantization (512 / 22050 s) bounds the tempo error to a few bpm
        assert!((result.tempo_bpm - 120.0).abs() < 4.0, "tempo {}", result.tempo_bpm);
        assert!(result.beat_times.len() >= 20);
        assert!(result.beat_times.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(result.onset_times.len(), result.onset_strengths.len());
        assert!(result.onset_times.len() >= 20);
        assert_eq!(result.envelope.times.len(), result.envelope.values.len());
    }

    #[test]
    fn test_deterministic() {
        let extractor = EnergyFluxExtractor::default();
        let wave = click_track(0.4, 8.0);
        assert_eq!(
            extractor.analyze_beats(&wave).unwrap(),
            extractor.analyze_beats(&wave).unwrap()
        );
    }

    #[test]
    fn test_silence_yields_no_beats() {
        let extractor = EnergyFluxExtractor::default();
        let result = extractor
            .analyze_beats(&Waveform::new(vec![0.0; SR as usize * 3], SR))
            .unwrap();
        assert_eq!(result.tempo_bpm, 0.0);
        assert!(result.beat_times.is_empty());
        assert!(result.onset_times.is_empty());
        assert!(!result.envelope.is_empty());
    }

    #[test]
    fn test_zero_sample_rate_rejected() {
        let extractor = EnergyFluxExtractor::default();
        assert!(matches!(
            extractor.analyze_beats(&Waveform::new(vec![0.1; 10], 0)),
            Err(FeatureError::InvalidSampleRate)
        ));
    }
}
