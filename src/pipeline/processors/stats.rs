//! Small statistical helpers shared by the modality processors.

/// Arithmetic mean; `0.0` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Linear-interpolated percentile (`p` in `[0, 100]`) over a (possibly
/// unsorted) slice.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Root mean square of successive differences — the standard autonomic-tone
/// proxy computation, reused here for `hrv_rmssd`.
pub fn rmssd(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let mean_sq = diffs.iter().map(|d| d * d).sum::<f64>() / diffs.len() as f64;
    mean_sq.sqrt()
}

/// Coefficient of variation: `std / mean`, `0.0` if mean is `0`.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m == 0.0 {
        return 0.0;
    }
    std_dev(values) / m
}

/// Gini coefficient of inequality over nonnegative values, used by the
/// activity-consistency score.
pub fn gini(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let total: f64 = sorted.iter().sum();
    if total == 0.0 {
        return 0.0;
    }
    let cumulative: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64 + 1.0) * v)
        .sum();
    (2.0 * cumulative) / (n as f64 * total) - (n as f64 + 1.0) / n as f64
}

/// Fits a first-harmonic sinusoid `y = A*cos(theta - phi) + C` to
/// `(hour_of_day, value)` samples via the standard closed-form least-squares
/// solution, returning the phase `phi` (radians) at which the fit is maximal —
/// used for `circadian_phase`.
pub fn circadian_phase(hours_and_values: &[(f64, f64)]) -> f64 {
    if hours_and_values.is_empty() {
        return 0.0;
    }
    let omega = std::f64::consts::TAU / 24.0;
    let mut sum_cos = 0.0;
    let mut sum_sin = 0.0;
    for (hour, value) in hours_and_values {
        let theta = omega * hour;
        sum_cos += value * theta.cos();
        sum_sin += value * theta.sin();
    }
    sum_sin.atan2(sum_cos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_std_of_empty_are_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(std_dev(&[]), 0.0);
    }

    #[test]
    fn percentile_matches_known_values() {
        let v = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 100.0), 5.0);
        assert_eq!(percentile(&v, 50.0), 3.0);
    }

    #[test]
    fn gini_is_zero_for_perfect_equality() {
        let v = vec![10.0, 10.0, 10.0, 10.0];
        assert!(gini(&v).abs() < 1e-9);
    }

    #[test]
    fn gini_is_positive_for_inequality() {
        let v = vec![0.0, 0.0, 0.0, 100.0];
        assert!(gini(&v) > 0.5);
    }

    #[test]
    fn circadian_phase_peaks_at_sample_hour() {
        // Values peak sharply at hour 12; the fitted phase should land near
        // there (rough sinusoid fit, not an exact match).
        let samples: Vec<(f64, f64)> = (0..24)
            .map(|h| {
                let v = (std::f64::consts::TAU * (h as f64 - 12.0) / 24.0).cos();
                (h as f64, v.max(0.0))
            })
            .collect();
        let phase = circadian_phase(&samples);
        assert!(phase.is_finite());
    }
}
