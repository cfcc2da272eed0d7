//! Preprocessor: resample an irregular `(timestamp, value)` series to a dense,
//! fixed-length, one-sample-per-minute array.

use chrono::{DateTime, Utc};

use crate::error::{DataValidationReason, PipelineError, PipelineResult};

/// Default target length: one sample per minute for 7 days.
pub const TARGET_LENGTH: usize = 10_080;

/// Hard cap beyond which an actigraphy sequence is rejected rather than
/// silently truncated.
pub const MAX_ACTIGRAPHY_LEN: usize = 20_160;

/// Resample `points` (need not be sorted) into a dense array of exactly
/// `target_length` samples, one per minute, left-padded with zeros when the
/// observed span is shorter than `target_length`. Validation: a non-finite
/// value in the input, or an input whose minute-span exceeds
/// `MAX_ACTIGRAPHY_LEN`, rejects the whole modality rather than silently
/// truncating or fabricating a sequence from partial data.
pub fn resample(
    points: &[(DateTime<Utc>, f64)],
    target_length: usize,
) -> PipelineResult<Vec<f64>> {
    if points.is_empty() {
        return Err(PipelineError::DataValidation(
            DataValidationReason::EmptyActigraphy,
        ));
    }

    for (i, (_, v)) in points.iter().enumerate() {
        if !v.is_finite() {
            return Err(PipelineError::DataValidation(
                DataValidationReason::NonFiniteValue(i),
            ));
        }
    }

    // Step 1: bucket into 1-minute bins by floor(timestamp / 60s), averaging
    // within a bin.
    let mut sorted: Vec<(i64, f64)> = points
        .iter()
        .map(|(ts, v)| (ts.timestamp().div_euclid(60), *v))
        .collect();
    sorted.sort_by_key(|(bucket, _)| *bucket);

    let earliest = sorted.first().unwrap().0;
    let latest = sorted.last().unwrap().0;
    let span = (latest - earliest + 1) as usize;

    if span > MAX_ACTIGRAPHY_LEN {
        return Err(PipelineError::DataValidation(
            DataValidationReason::ActigraphyTooLarge(span),
        ));
    }

    let mut sums = vec![0.0_f64; span];
    let mut counts = vec![0u32; span];
    for (bucket, v) in sorted {
        let idx = (bucket - earliest) as usize;
        sums[idx] += v;
        counts[idx] += 1;
    }

    let mut dense: Vec<f64> = sums
        .into_iter()
        .zip(counts)
        .map(|(sum, count)| if count > 0 { sum / count as f64 } else { 0.0 })
        .collect();

    // Steps 3-5: keep the most recent `target_length` bins, or left-pad with
    // zeros to reach it.
    if dense.len() >= target_length {
        let drop = dense.len() - target_length;
        dense.drain(0..drop);
    } else {
        let pad = target_length - dense.len();
        let mut padded = vec![0.0_f64; pad];
        padded.append(&mut dense);
        dense = padded;
    }

    Ok(dense)
}

/// Convenience wrapper for the canonical 10,080-sample week used by the PAT
/// transformer.
pub fn resample_to_week(points: &[(DateTime<Utc>, f64)]) -> PipelineResult<[f64; TARGET_LENGTH]> {
    let dense = resample(points, TARGET_LENGTH)?;
    let mut arr = [0.0_f64; TARGET_LENGTH];
    arr.copy_from_slice(&dense);
    Ok(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn minute(n: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(n * 60, 0).unwrap()
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = resample(&[], TARGET_LENGTH).unwrap_err();
        assert_eq!(err.reason_code(), "empty_actigraphy");
    }

    #[test]
    fn short_input_is_left_padded() {
        let points: Vec<_> = (0..10).map(|i| (minute(i), 5.0)).collect();
        let out = resample(&points, 20).unwrap();
        assert_eq!(out.len(), 20);
        assert!(out[0..10].iter().all(|&v| v == 0.0));
        assert!(out[10..20].iter().all(|&v| v == 5.0));
    }

    #[test]
    fn long_input_keeps_most_recent() {
        let points: Vec<_> = (0..30)
            .map(|i| (minute(i), if i < 10 { 1.0 } else { 9.0 }))
            .collect();
        let out = resample(&points, 20).unwrap();
        assert_eq!(out.len(), 20);
        assert!(out.iter().all(|&v| v == 9.0));
    }

    #[test]
    fn missing_interior_bins_are_zero_filled() {
        let points = vec![(minute(0), 4.0), (minute(5), 8.0)];
        let out = resample(&points, 6).unwrap();
        assert_eq!(out, vec![4.0, 0.0, 0.0, 0.0, 0.0, 8.0]);
    }

    #[test]
    fn non_finite_value_is_rejected() {
        let points = vec![(minute(0), f64::NAN)];
        let err = resample(&points, 10).unwrap_err();
        assert_eq!(err.reason_code(), "non_finite_value");
    }

    #[test]
    fn too_large_span_is_rejected() {
        let points = vec![(minute(0), 1.0), (minute(MAX_ACTIGRAPHY_LEN as i64 + 1), 1.0)];
        let err = resample(&points, TARGET_LENGTH).unwrap_err();
        assert_eq!(err.reason_code(), "data_too_large");
    }

    #[test]
    fn same_minute_samples_are_averaged() {
        let base = minute(0);
        let points = vec![
            (base, 2.0),
            (base + Duration::seconds(10), 4.0),
            (base + Duration::seconds(20), 6.0),
        ];
        let out = resample(&points, 1).unwrap();
        assert_eq!(out, vec![4.0]);
    }
}
