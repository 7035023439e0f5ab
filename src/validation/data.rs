//! Input checks shared by the configuration layer and the estimator

use crate::core::{Fingerprint, LocatedFingerprint, RadioSource};
use crate::validation::error::ConfigError;
use std::collections::HashSet;
use std::sync::Arc;

/// Check the nearest-fingerprint bounds: `min >= 1` and `max >= min`
pub fn validate_nearest_bounds(min: usize, max: Option<usize>) -> Result<(), ConfigError> {
    if min < 1 {
        return Err(ConfigError::InvalidParameter {
            parameter: "min_nearest_fingerprints".to_string(),
            value: min.to_string(),
            reason: "at least one nearest fingerprint is required".to_string(),
        });
    }
    if let Some(max) = max {
        if max < min {
            return Err(ConfigError::InvalidParameter {
                parameter: "max_nearest_fingerprints".to_string(),
                value: max.to_string(),
                reason: format!("must be greater than or equal to minimum ({})", min),
            });
        }
    }
    Ok(())
}

/// Check that a scalar parameter is finite and strictly positive
pub fn validate_positive(parameter: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidParameter {
            parameter: parameter.to_string(),
            value: value.to_string(),
            reason: "must be finite and greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Check that a source set is non-empty and has unique ids
pub fn validate_sources<const D: usize>(sources: &[Arc<RadioSource<D>>]) -> Result<(), ConfigError> {
    if sources.is_empty() {
        return Err(ConfigError::MissingInput {
            input: "sources".to_string(),
        });
    }
    let mut seen = HashSet::new();
    for source in sources {
        if !seen.insert(source.id()) {
            return Err(ConfigError::InvalidParameter {
                parameter: "sources".to_string(),
                value: source.id().to_string(),
                reason: "source ids must be unique".to_string(),
            });
        }
    }
    Ok(())
}

/// Check the calibration set is non-empty
pub fn validate_located_fingerprints<const D: usize>(
    fingerprints: &[LocatedFingerprint<D>],
) -> Result<(), ConfigError> {
    if fingerprints.is_empty() {
        return Err(ConfigError::MissingInput {
            input: "located fingerprints".to_string(),
        });
    }
    Ok(())
}

/// Check the query carries at least one reading
pub fn validate_query<const D: usize>(query: &Fingerprint<D>) -> Result<(), ConfigError> {
    if query.is_empty() {
        return Err(ConfigError::MissingInput {
            input: "query fingerprint readings".to_string(),
        });
    }
    Ok(())
}

/// Reason the inputs are not ready for an estimate, `None` when ready
pub fn readiness_issue<const D: usize>(
    fingerprints: &[LocatedFingerprint<D>],
    query: Option<&Fingerprint<D>>,
    sources: &[Arc<RadioSource<D>>],
) -> Option<String> {
    if fingerprints.is_empty() {
        return Some("no located fingerprints".to_string());
    }
    match query {
        None => return Some("no query fingerprint".to_string()),
        Some(q) if q.is_empty() => return Some("query fingerprint has no readings".to_string()),
        Some(_) => {}
    }
    if sources.is_empty() {
        return Some("no radio sources".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Position, Reading, SourceLocation};

    #[test]
    fn test_nearest_bounds() {
        assert!(validate_nearest_bounds(1, None).is_ok());
        assert!(validate_nearest_bounds(2, Some(2)).is_ok());
        assert!(validate_nearest_bounds(0, None).is_err());
        assert!(matches!(
            validate_nearest_bounds(3, Some(2)),
            Err(ConfigError::InvalidParameter { ref parameter, .. }) if parameter == "max_nearest_fingerprints"
        ));
    }

    #[test]
    fn test_positive_parameter() {
        assert!(validate_positive("exponent", 2.0).is_ok());
        assert!(validate_positive("exponent", 0.0).is_err());
        assert!(validate_positive("exponent", f64::NAN).is_err());
    }

    #[test]
    fn test_sources_must_be_unique() {
        let a = Arc::new(RadioSource::<2>::new("a", 2.4e9));
        assert!(validate_sources(&[a.clone()]).is_ok());
        assert!(validate_sources(&[a.clone(), a]).is_err());
        assert!(validate_sources::<2>(&[]).is_err());
    }

    #[test]
    fn test_readiness_issue() {
        let source = Arc::new(RadioSource::located(
            "a",
            2.4e9,
            SourceLocation::new(Position::xy(0.0, 0.0)),
        ));
        let located =
            vec![LocatedFingerprint::new(vec![Reading::new(source.clone(), -50.0)], Position::xy(1.0, 0.0)).unwrap()];
        let query = Fingerprint::new(vec![Reading::new(source.clone(), -52.0)]).unwrap();

        assert!(readiness_issue(&located, Some(&query), &[source.clone()]).is_none());
        assert!(readiness_issue(&[], Some(&query), &[source.clone()]).is_some());
        assert!(readiness_issue(&located, None, &[source.clone()]).is_some());
        assert!(readiness_issue(&located, Some(&query), &[]).is_some());
        let empty = Fingerprint::new(vec![]).unwrap();
        assert!(readiness_issue(&located, Some(&empty), &[source]).is_some());
    }
}
