//! RMS loudness normalization with peak headroom.

/// Default target loudness in dBFS (RMS).
pub const DEFAULT_LEVEL_DB: f32 = -20.0;

/// Peak ceiling applied after gain.
pub const PEAK_CEILING: f32 = 0.95;

/// Root mean square of a sample block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Largest absolute sample value.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |max, &s| max.max(s.abs()))
}

/// Scale `samples` so their RMS matches `target_level_db`.
///
/// Silence is returned unchanged. When the gained signal would peak above
/// [`PEAK_CEILING`], it is scaled down so the peak sits exactly on the ceiling;
/// in that case the RMS ends up below the target.
pub fn normalize(samples: &[f32], target_level_db: f32) -> Vec<f32> {
    let current = rms(samples);
    if current == 0.0 {
        return samples.to_vec();
    }

    let target = 10f32.powf(target_level_db / 20.0);
    let gain = target / current;
    let mut out: Vec<f32> = samples.iter().map(|&s| s * gain).collect();

    let max = peak(&out);
    if max > PEAK_CEILING {
        let scale = PEAK_CEILING / max;
        for s in &mut out {
            *s *= scale;
        }
    }

    out
}
