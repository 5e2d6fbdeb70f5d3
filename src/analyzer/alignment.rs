//! Rhythmic alignment: beat period, phase shift, 8-count labels, grid confidence
//! and onset-to-beat snapping.
//!
//! Everything here is pure and total. Degenerate input (no beats, one beat, an empty
//! envelope) produces empty or zero output rather than an error.

use super::features::OnsetEnvelope;

/// Period assumed when fewer than two beats are available, seconds.
pub const FALLBACK_PERIOD: f64 = 0.5;

/// Number of candidate shifts searched over [-period, +period], endpoints included.
pub const PHASE_CANDIDATES: usize = 41;

/// An onset within this distance of its grid slot counts as aligned, seconds.
pub const PHASE_TOLERANCE: f64 = 0.07;

/// Beats per 8-count measure.
pub const COUNTS_PER_MEASURE: i64 = 8;

/// One beat of the grid with its dance-count labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatLabel {
    /// Position in the input beat sequence.
    pub index: usize,
    /// Beat time in whole milliseconds (truncated).
    pub ts_ms: i64,
    /// 1..=8
    pub count: i64,
    pub measure: i64,
}

impl BeatLabel {
    fn secs(&self) -> f64 {
        self.ts_ms as f64 / 1000.0
    }
}

/// Result of aligning a track's beats against its onsets.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub period: f64,
    /// Seconds; applied relative to the first beat.
    pub phase_shift: f64,
    pub beats: Vec<BeatLabel>,
    /// 0..=1
    pub confidence: f64,
    pub measures: i64,
}

impl Alignment {
    /// Phase shift in whole milliseconds, truncated toward zero.
    pub fn phase_shift_ms(&self) -> i64 {
        (self.phase_shift * 1000.0) as i64
    }

    /// The labeled beat nearest to `t` (seconds).
    pub fn snap(&self, t: f64) -> Option<&BeatLabel> {
        snap_to_beat(&self.beats, t)
    }
}

/// Run the full alignment for one track.
pub fn align(beat_times: &[f64], onset_times: &[f64], envelope: &OnsetEnvelope) -> Alignment {
    let period = beat_period(beat_times).unwrap_or(FALLBACK_PERIOD);
    let phase_shift = estimate_phase_shift(beat_times, onset_times);
    let beats = map_to_8count(beat_times, phase_shift);
    let measures = measure_count(&beats);
    let confidence = grid_confidence(beat_times, envelope);

    Alignment {
        period,
        phase_shift,
        beats,
        confidence,
        measures,
    }
}

/// Median inter-beat interval; `None` with fewer than two beats.
pub fn beat_period(beat_times: &[f64]) -> Option<f64> {
    if beat_times.len() < 2 {
        return None;
    }
    let mut diffs: Vec<f64> = beat_times.windows(2).map(|w| w[1] - w[0]).collect();
    Some(median(&mut diffs))
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// The `k`-th of [`PHASE_CANDIDATES`] evenly spaced shifts over [-period, period].
fn phase_candidate(period: f64, k: usize) -> f64 {
    if k == PHASE_CANDIDATES - 1 {
        return period;
    }
    let step = 2.0 * period / (PHASE_CANDIDATES - 1) as f64;
    k as f64 * step - period
}

/// Shift of the beat grid that puts the largest fraction of onsets within
/// [`PHASE_TOLERANCE`] of a grid slot. Earlier candidates win ties.
pub fn estimate_phase_shift(beat_times: &[f64], onset_times: &[f64]) -> f64 {
    if onset_times.is_empty() {
        return 0.0;
    }
    let period = match beat_period(beat_times) {
        Some(p) if p > 0.0 => p,
        _ => return 0.0,
    };
    let base = beat_times[0];

    let mut best_shift = 0.0;
    let mut best_score = -1.0;

    for k in 0..PHASE_CANDIDATES {
        let shift = phase_candidate(period, k);
        let origin = base + shift;
        let aligned = onset_times
            .iter()
            .filter(|&&t| {
                let steps = ((t - origin) / period).round_ties_even();
                (t - (origin + steps * period)).abs() < PHASE_TOLERANCE
            })
            .count();
        let score = aligned as f64 / onset_times.len() as f64;
        if score > best_score {
            best_shift = shift;
            best_score = score;
        }
    }

    best_shift
}

/// Label every beat with its cyclic 1..=8 count and measure number.
///
/// Indices are measured from `beat0 + phase_shift`; a positive shift can make the
/// first index negative, which floors into measure -1 with count 8.
pub fn map_to_8count(beat_times: &[f64], phase_shift: f64) -> Vec<BeatLabel> {
    let Some(&first) = beat_times.first() else {
        return Vec::new();
    };
    let period = beat_period(beat_times).unwrap_or(FALLBACK_PERIOD);
    let base = first + phase_shift;

    beat_times
        .iter()
        .enumerate()
        .map(|(i, &t)| {
            let beat_index = if period > 0.0 {
                ((t - base) / period).round_ties_even() as i64
            } else {
                i as i64
            };
            BeatLabel {
                index: i,
                ts_ms: (t * 1000.0) as i64,
                count: beat_index.rem_euclid(COUNTS_PER_MEASURE) + 1,
                measure: beat_index.div_euclid(COUNTS_PER_MEASURE),
            }
        })
        .collect()
}

/// Number of measures spanned: highest measure index + 1, or 0 with no beats.
pub fn measure_count(beats: &[BeatLabel]) -> i64 {
    beats
        .iter()
        .map(|b| b.measure)
        .max()
        .map_or(0, |m| (m + 1).max(0))
}

/// How well a regular grid from the first beat lines up with onset emphasis.
///
/// Each grid time picks the first envelope sample at or after it; the mean of those
/// samples over the envelope maximum is the score.
pub fn grid_confidence(beat_times: &[f64], envelope: &OnsetEnvelope) -> f64 {
    if beat_times.len() < 3 || envelope.is_empty() {
        return 0.0;
    }
    let period = match beat_period(beat_times) {
        Some(p) if p > 0.0 => p,
        _ => return 0.0,
    };

    let len = envelope.len();
    let times = &envelope.times[..len];
    let values = &envelope.values[..len];

    let max = values.iter().copied().fold(f64::MIN, f64::max);
    if max <= 0.0 || !max.is_finite() {
        return 0.0;
    }

    let phase = beat_times[0];
    let t_max = times[len - 1];
    if phase > t_max {
        return 0.0;
    }

    let n = ((t_max - phase) / period).floor() as usize + 1;
    let sum: f64 = (0..n)
        .map(|k| {
            let g = (phase + k as f64 * period).max(0.0).min(t_max);
            let idx = times.partition_point(|&x| x < g).min(len - 1);
            values[idx]
        })
        .sum();

    (sum / n as f64 / max).clamp(0.0, 1.0)
}

/// Nearest labeled beat to `t`, by absolute distance; the earlier beat wins ties.
/// Times before the first beat or after the last snap to that boundary beat.
pub fn snap_to_beat(beats: &[BeatLabel], t: f64) -> Option<&BeatLabel> {
    let last = beats.last()?;
    let i = beats.partition_point(|b| b.secs() < t);
    if i == 0 {
        return beats.first();
    }
    if i == beats.len() {
        return Some(last);
    }

    let (before, after) = (&beats[i - 1], &beats[i]);
    if t - before.secs() <= after.secs() - t {
        Some(before)
    } else {
        Some(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize, interval: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 * interval).collect()
    }

    /// Envelope sampled every 10 ms, `peak` on multiples of `every` frames, `floor` elsewhere.
    fn pulse_envelope(frames: usize, every: usize, offset: usize, peak: f64, floor: f64) -> OnsetEnvelope {
        OnsetEnvelope {
            times: (0..frames).map(|k| k as f64 / 100.0).collect(),
            values: (0..frames)
                .map(|k| if k >= offset && (k - offset) % every == 0 { peak } else { floor })
                .collect(),
        }
    }

    #[test]
    fn test_period_constant_interval_is_exact() {
        assert_eq!(beat_period(&grid(16, 0.5)), Some(0.5));
        assert_eq!(beat_period(&grid(2, 0.25)), Some(0.25));
    }

    #[test]
    fn test_period_is_median() {
        // diffs: 0.4, 0.6, 0.5 -> median 0.5
        assert_eq!(beat_period(&[0.0, 0.4, 1.0, 1.5]), Some(0.5));
        // even count averages the middle pair: 0.25, 0.5, 0.5, 1.0 -> 0.5
        assert_eq!(beat_period(&[0.0, 0.25, 0.75, 1.25, 2.25]), Some(0.5));
        assert_eq!(beat_period(&[1.0]), None);
        assert_eq!(beat_period(&[]), None);
    }

    #[test]
    fn test_8count_is_cyclic() {
        let labels = map_to_8count(&grid(16, 0.5), 0.0);
        let counts: Vec<i64> = labels[..8].iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(labels[..8].iter().all(|b| b.measure == 0));

        assert_eq!(labels[8].count, 1);
        assert_eq!(labels[8].measure, 1);
        assert_eq!(labels[15].count, 8);
        assert_eq!(labels[9].ts_ms, 4500);
        assert_eq!(measure_count(&labels), 2);
    }

    #[test]
    fn test_8count_preserves_input_order_and_indices() {
        let labels = map_to_8count(&[0.0, 0.5, 1.0], 0.0);
        let idx: Vec<usize> = labels.iter().map(|b| b.index).collect();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[test]
    fn test_8count_positive_phase_floors_first_beat() {
        let labels = map_to_8count(&[0.0, 0.5, 1.0], 0.5);
        let pairs: Vec<(i64, i64)> = labels.iter().map(|b| (b.count, b.measure)).collect();
        assert_eq!(pairs, vec![(8, -1), (1, 0), (2, 0)]);
        assert_eq!(measure_count(&labels), 1);
    }

    #[test]
    fn test_8count_degenerate_inputs() {
        assert!(map_to_8count(&[], 0.0).is_empty());

        let single = map_to_8count(&[2.0], 0.0);
        assert_eq!(single, vec![BeatLabel { index: 0, ts_ms: 2000, count: 1, measure: 0 }]);
        assert_eq!(measure_count(&[]), 0);
    }

    #[test]
    fn test_phase_zero_without_onsets_or_beats() {
        assert_eq!(estimate_phase_shift(&grid(8, 0.5), &[]), 0.0);
        assert_eq!(estimate_phase_shift(&[0.0], &[0.1, 0.2]), 0.0);
        assert_eq!(estimate_phase_shift(&[], &[0.1]), 0.0);
    }

    #[test]
    fn test_phase_candidates_span_both_ends() {
        assert_eq!(phase_candidate(0.5, 0), -0.5);
        assert_eq!(phase_candidate(0.5, PHASE_CANDIDATES - 1), 0.5);
        assert!((phase_candidate(0.5, 20)).abs() < 1e-12);
    }

    #[test]
    fn test_phase_first_best_candidate_wins() {
        // Onsets sit 100 ms after each beat. Candidates step 25 ms from -0.5 s;
        // the first one within 70 ms of the onsets (mod one period) is -0.45 s.
        let beats = grid(16, 0.5);
        let onsets: Vec<f64> = beats.iter().map(|b| b + 0.1).collect();
        let shift = estimate_phase_shift(&beats, &onsets);
        assert!((shift - -0.45).abs() < 1e-9, "shift {shift}");
    }

    #[test]
    fn test_phase_invariant_to_one_period_onset_shift() {
        let beats = grid(16, 0.5);
        // Kept clear of the 70 ms boundary for every candidate so rounding can't flip a hit
        let onsets = vec![0.11, 0.61, 1.09, 1.36, 2.11, 2.59, 3.11, 4.56];
        let shifted: Vec<f64> = onsets.iter().map(|t| t + 0.5).collect();

        assert_eq!(
            estimate_phase_shift(&beats, &onsets),
            estimate_phase_shift(&beats, &shifted)
        );
    }

    #[test]
    fn test_confidence_perfect_alignment() {
        // 120 bpm beats over a 4 s envelope with peaks exactly every 0.5 s
        let env = pulse_envelope(401, 50, 0, 1.0, 0.1);
        let conf = grid_confidence(&grid(8, 0.5), &env);
        assert!((conf - 1.0).abs() < 1e-12, "confidence {conf}");
    }

    #[test]
    fn test_confidence_misaligned_grid_is_lower() {
        let env = pulse_envelope(401, 50, 25, 1.0, 0.1);
        let conf = grid_confidence(&grid(8, 0.5), &env);
        assert!((conf - 0.1).abs() < 1e-12, "confidence {conf}");
    }

    #[test]
    fn test_confidence_bounds() {
        let env = OnsetEnvelope {
            times: (0..300).map(|k| k as f64 / 100.0).collect(),
            values: (0..300).map(|k| ((k * 37) % 11) as f64).collect(),
        };
        for interval in [0.3, 0.45, 0.5, 0.71] {
            let conf = grid_confidence(&grid(6, interval), &env);
            assert!((0.0..=1.0).contains(&conf), "confidence {conf}");
        }
    }

    #[test]
    fn test_confidence_degenerate_cases_are_zero() {
        let env = pulse_envelope(401, 50, 0, 1.0, 0.1);
        // fewer than three beats
        assert_eq!(grid_confidence(&[0.0, 0.5], &env), 0.0);
        // empty envelope
        assert_eq!(grid_confidence(&grid(8, 0.5), &OnsetEnvelope::default()), 0.0);
        // all-zero envelope
        let flat = pulse_envelope(401, 50, 0, 0.0, 0.0);
        assert_eq!(grid_confidence(&grid(8, 0.5), &flat), 0.0);
        // first beat after the analyzed duration
        assert_eq!(grid_confidence(&[10.0, 10.5, 11.0], &env), 0.0);
        // non-positive period
        assert_eq!(grid_confidence(&[1.0, 1.0, 1.0], &env), 0.0);
    }

    #[test]
    fn test_snap_nearest_and_boundaries() {
        let labels = map_to_8count(&grid(4, 0.5), 0.0);

        assert_eq!(snap_to_beat(&labels, 0.6).unwrap().index, 1);
        assert_eq!(snap_to_beat(&labels, 0.9).unwrap().index, 2);
        // equidistant: earlier beat wins
        assert_eq!(snap_to_beat(&labels, 0.75).unwrap().index, 1);
        // outside the grid
        assert_eq!(snap_to_beat(&labels, -3.0).unwrap().index, 0);
        assert_eq!(snap_to_beat(&labels, 99.0).unwrap().index, 3);

        assert!(snap_to_beat(&[], 1.0).is_none());
    }

    #[test]
    fn test_snap_matches_linear_scan() {
        let beats = [0.0, 0.48, 1.02, 1.5, 1.97, 2.51, 3.0];
        let labels = map_to_8count(&beats, 0.0);
        for k in 0..400 {
            let t = k as f64 * 0.0083 - 0.2;
            let linear = labels
                .iter()
                .enumerate()
                .fold(None::<(usize, f64)>, |best, (i, b)| {
                    let d = (b.ts_ms as f64 / 1000.0 - t).abs();
                    match best {
                        Some((_, bd)) if bd <= d => best,
                        _ => Some((i, d)),
                    }
                })
                .map(|(i, _)| i);
            assert_eq!(snap_to_beat(&labels, t).map(|b| b.index), linear, "t = {t}");
        }
    }

    #[test]
    fn test_align_end_to_end_without_onsets() {
        let beats = grid(8, 0.5);
        let env = pulse_envelope(401, 50, 0, 1.0, 0.1);
        let a = align(&beats, &[], &env);
        assert_eq!(a.period, 0.5);
        assert_eq!(a.phase_shift, 0.0);
        assert_eq!(a.phase_shift_ms(), 0);
        assert_eq!(a.measures, 1);
        assert_eq!(a.beats.len(), 8);
        assert_eq!(a.snap(1.1).unwrap().count, 3);
    }

    #[test]
    fn test_align_single_beat() {
        let a = align(&[1.0], &[0.5, 1.2], &OnsetEnvelope::default());
        assert_eq!(a.period, FALLBACK_PERIOD);
        assert_eq!(a.phase_shift, 0.0);
        assert_eq!(a.confidence, 0.0);
        assert_eq!(a.measures, 1);
        assert_eq!(a.snap(0.2).unwrap().ts_ms, 1000);
    }
}
