//! Translation from the provider's vocabulary into the internal one.

use thiserror::Error;

use crate::QualityRating;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("provider returned unrecognized quality rating `{0}`")]
    UnknownQuality(String),
    #[error("provider response carried no quality rating")]
    MissingQuality,
}

/// Maps the provider's GREEN/YELLOW/RED scale. Anything else is an error;
/// callers keep the last known-good quality instead of guessing one.
pub fn map_quality(raw: Option<&str>) -> Result<QualityRating, MappingError> {
    let raw = raw.map(str::trim).filter(|v| !v.is_empty());
    let Some(value) = raw else {
        return Err(MappingError::MissingQuality);
    };
    match value.to_ascii_uppercase().as_str() {
        "GREEN" => Ok(QualityRating::High),
        "YELLOW" => Ok(QualityRating::Medium),
        "RED" => Ok(QualityRating::Low),
        _ => Err(MappingError::UnknownQuality(value.to_string())),
    }
}

const LIMIT_TIERS: &[(&str, &str)] = &[
    ("TIER_50", "50"),
    ("TIER_250", "250"),
    ("TIER_1K", "1000"),
    ("TIER_2K", "2000"),
    ("TIER_10K", "10000"),
    ("TIER_100K", "100000"),
    ("TIER_UNLIMITED", "Unlimited"),
];

/// Normalizes a messaging-limit tier code. Unknown codes degrade to a
/// best-effort numeric rendering and never fail.
pub fn map_limit_tier(raw: &str) -> String {
    let code = raw.trim().to_ascii_uppercase();
    if let Some((_, label)) = LIMIT_TIERS.iter().find(|(k, _)| *k == code) {
        return (*label).to_string();
    }

    let stripped = code.strip_prefix("TIER_").unwrap_or(&code);
    expand_suffix(stripped).unwrap_or_else(|| stripped.to_string())
}

fn expand_suffix(value: &str) -> Option<String> {
    let (digits, factor) = if let Some(d) = value.strip_suffix('K') {
        (d, 1_000u64)
    } else if let Some(d) = value.strip_suffix('M') {
        (d, 1_000_000u64)
    } else {
        (value, 1u64)
    };
    let n: u64 = digits.parse().ok()?;
    n.checked_mul(factor).map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_provider_colors() {
        assert_eq!(map_quality(Some("GREEN")), Ok(QualityRating::High));
        assert_eq!(map_quality(Some("yellow")), Ok(QualityRating::Medium));
        assert_eq!(map_quality(Some(" RED ")), Ok(QualityRating::Low));
    }

    #[test]
    fn unknown_quality_is_an_error_not_medium() {
        assert_eq!(
            map_quality(Some("UNKNOWN")),
            Err(MappingError::UnknownQuality("UNKNOWN".into()))
        );
        assert_eq!(map_quality(Some("")), Err(MappingError::MissingQuality));
        assert_eq!(map_quality(None), Err(MappingError::MissingQuality));
    }

    #[test]
    fn known_tiers_use_lookup_table() {
        assert_eq!(map_limit_tier("TIER_1K"), "1000");
        assert_eq!(map_limit_tier("TIER_250"), "250");
        assert_eq!(map_limit_tier("tier_unlimited"), "Unlimited");
    }

    #[test]
    fn unknown_tiers_pass_through_best_effort() {
        assert_eq!(map_limit_tier("TIER_5K"), "5000");
        assert_eq!(map_limit_tier("TIER_1M"), "1000000");
        assert_eq!(map_limit_tier("TIER_75"), "75");
        assert_eq!(map_limit_tier("TIER_CUSTOM"), "CUSTOM");
    }
}
