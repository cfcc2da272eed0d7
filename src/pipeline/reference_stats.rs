//! Static NHANES population reference statistics used to normalize derived
//! features into population-comparative z-scores. The tables below are
//! fixed normative means/standard deviations per publication year, with
//! optional age-group and sex stratification; lookups fall back to the
//! nearest available year and ignore unrecognized strata rather than
//! erroring, since a missing stratum should degrade gracefully for a
//! best-effort enrichment step.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

/// A single `(mean, std)` normative pair.
pub type NormStats = (f64, f64);

/// Daily step-count normative stats keyed by NHANES publication year.
pub static NHANES_REFERENCE_STATS: Lazy<BTreeMap<u16, NormStats>> = Lazy::new(|| {
    BTreeMap::from([
        (2017, (4_900.0, 2_900.0)),
        (2020, (5_100.0, 3_000.0)),
        (2025, (5_300.0, 3_100.0)),
    ])
});

/// Age-group stratified variants of the latest reference year.
pub static AGE_STRATIFIED_STATS: Lazy<BTreeMap<&'static str, NormStats>> = Lazy::new(|| {
    BTreeMap::from([
        ("18-29", (6_800.0, 3_300.0)),
        ("30-39", (6_200.0, 3_100.0)),
        ("40-49", (5_700.0, 3_000.0)),
        ("50-59", (5_000.0, 2_900.0)),
        ("60-69", (4_200.0, 2_600.0)),
        ("70+", (3_300.0, 2_300.0)),
    ])
});

/// Sex-stratified variants of the latest reference year.
pub static SEX_STRATIFIED_STATS: Lazy<BTreeMap<&'static str, NormStats>> = Lazy::new(|| {
    BTreeMap::from([("male", (5_600.0, 3_200.0)), ("female", (5_000.0, 3_000.0))])
});

/// A proxy value more than this many standard deviations from its reference
/// mean is counted as an extreme outlier by `validate_proxy_values`.
pub const EXTREME_OUTLIER_THRESHOLD: f64 = 3.0;

fn default_year() -> u16 {
    *NHANES_REFERENCE_STATS.keys().next_back().expect("static table is non-empty")
}

/// Looks up `(mean, std)` for the given year/age-group/sex, preferring the
/// most specific stratification available and falling back to the nearest
/// known year, then the unstratified default, when a stratum is missing.
pub fn lookup_norm_stats(year: Option<u16>, age_group: Option<&str>, sex: Option<&str>) -> NormStats {
    if let Some(sex) = sex {
        if let Some(stats) = SEX_STRATIFIED_STATS.get(sex.to_lowercase().as_str()) {
            return *stats;
        }
    }
    if let Some(age_group) = age_group {
        if let Some(stats) = AGE_STRATIFIED_STATS.get(age_group) {
            return *stats;
        }
    }
    let year = year.unwrap_or_else(default_year);
    if let Some(stats) = NHANES_REFERENCE_STATS.get(&year) {
        return *stats;
    }
    // Unknown year: fall back to the closest year on record rather than the
    // unstratified arithmetic default, so a forward-dated request still gets
    // a meaningfully recent baseline.
    let closest = NHANES_REFERENCE_STATS
        .keys()
        .min_by_key(|&&y| (y as i32 - year as i32).abs())
        .copied()
        .unwrap_or_else(default_year);
    NHANES_REFERENCE_STATS[&closest]
}

/// The years for which an unstratified reference entry exists.
pub fn available_years() -> Vec<u16> {
    NHANES_REFERENCE_STATS.keys().copied().collect()
}

/// The age groups for which a stratified reference entry exists.
pub fn available_age_groups() -> Vec<&'static str> {
    AGE_STRATIFIED_STATS.keys().copied().collect()
}

/// `z = (x - mean) / std`; `std <= 0` yields `0.0` rather than `NaN`/`inf`.
pub fn z_score(value: f64, stats: NormStats) -> f64 {
    let (mean, std) = stats;
    if std <= 0.0 {
        return 0.0;
    }
    (value - mean) / std
}

/// Aggregate validation summary over a batch of proxy values (e.g. daily step
/// totals) against the default reference distribution: per-value z-scores,
/// how many fall beyond `EXTREME_OUTLIER_THRESHOLD`, and whether the batch as
/// a whole passes (fewer than 20% extreme outliers).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyValidation {
    pub total_values: usize,
    pub mean_z_score: f64,
    pub std_z_score: f64,
    pub extreme_low_count: usize,
    pub extreme_high_count: usize,
    pub outlier_percentage: f64,
    pub validation_passed: bool,
}

pub fn validate_proxy_values(values: &[f64]) -> ProxyValidation {
    if values.is_empty() {
        return ProxyValidation {
            total_values: 0,
            mean_z_score: f64::NAN,
            std_z_score: f64::NAN,
            extreme_low_count: 0,
            extreme_high_count: 0,
            outlier_percentage: 0.0,
            validation_passed: true,
        };
    }
    let stats = lookup_norm_stats(None, None, None);
    let z_scores: Vec<f64> = values.iter().map(|&v| z_score(v, stats)).collect();

    let mean_z = z_scores.iter().sum::<f64>() / z_scores.len() as f64;
    let variance =
        z_scores.iter().map(|z| (z - mean_z).powi(2)).sum::<f64>() / z_scores.len() as f64;
    let std_z = variance.sqrt();

    let extreme_low_count = z_scores.iter().filter(|&&z| z <= -EXTREME_OUTLIER_THRESHOLD).count();
    let extreme_high_count = z_scores.iter().filter(|&&z| z >= EXTREME_OUTLIER_THRESHOLD).count();
    let outlier_percentage =
        100.0 * (extreme_low_count + extreme_high_count) as f64 / values.len() as f64;

    ProxyValidation {
        total_values: values.len(),
        mean_z_score: mean_z,
        std_z_score: std_z,
        extreme_low_count,
        extreme_high_count,
        outlier_percentage,
        validation_passed: outlier_percentage < 20.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_falls_back_to_default_for_unknown_year() {
        let (mean, std) = lookup_norm_stats(Some(2099), None, None);
        let (default_mean, default_std) = lookup_norm_stats(None, None, None);
        assert_eq!((mean, std), (default_mean, default_std));
    }

    #[test]
    fn sex_stratification_differs_by_sex() {
        let male = lookup_norm_stats(None, None, Some("MALE"));
        let female = lookup_norm_stats(None, None, Some("female"));
        assert_ne!(male, female);
    }

    #[test]
    fn unknown_age_group_falls_back_without_erroring() {
        let stats = lookup_norm_stats(Some(2025), Some("not-a-group"), None);
        assert_eq!(stats, lookup_norm_stats(Some(2025), None, None));
    }

    #[test]
    fn z_score_of_mean_is_zero() {
        let stats = (100.0, 10.0);
        assert_eq!(z_score(100.0, stats), 0.0);
    }

    #[test]
    fn validate_proxy_values_flags_outliers() {
        let values = vec![4.0, 4.2, 4.5, 4.1, 30_000.0, -30_000.0];
        let result = validate_proxy_values(&values);
        assert!(result.extreme_low_count + result.extreme_high_count > 0);
        assert!(result.outlier_percentage > 0.0);
    }

    #[test]
    fn validate_proxy_values_empty_list_does_not_panic() {
        let result = validate_proxy_values(&[]);
        assert_eq!(result.total_values, 0);
        assert!(result.mean_z_score.is_nan());
    }
}
