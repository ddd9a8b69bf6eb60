//! Common validation utilities.

use chrono::{DateTime, Utc};
use validator::ValidationError;

/// Longest free-text filter value accepted.
pub const MAX_FILTER_TEXT_LENGTH: usize = 200;

/// Validates that an optional date range is ordered (`from <= to`).
pub fn validate_date_range(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<(), ValidationError> {
    match (from, to) {
        (Some(from), Some(to)) if from > to => {
            let mut err = ValidationError::new("date_range");
            err.message = Some("appliedFrom must not be after appliedTo".into());
            Err(err)
        }
        _ => Ok(()),
    }
}

/// Validates a free-text filter: non-blank, bounded, no control characters.
pub fn validate_filter_text(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("filter_blank");
        err.message = Some("Filter text must not be blank".into());
        return Err(err);
    }

    if value.chars().count() > MAX_FILTER_TEXT_LENGTH {
        let mut err = ValidationError::new("filter_length");
        err.message = Some(
            format!(
                "Filter text must be at most {} characters",
                MAX_FILTER_TEXT_LENGTH
            )
            .into(),
        );
        return Err(err);
    }

    if value.chars().any(char::is_control) {
        let mut err = ValidationError::new("filter_control_chars");
        err.message = Some("Filter text must not contain control characters".into());
        return Err(err);
    }

    Ok(())
}

/// Validates that a list contains no duplicate entries.
pub fn validate_unique<T: PartialEq>(items: &[T]) -> Result<(), ValidationError> {
    for (i, item) in items.iter().enumerate() {
        if items[..i].contains(item) {
            let mut err = ValidationError::new("duplicate_entry");
            err.message = Some("List must not contain duplicates".into());
            return Err(err);
        }
    }
    Ok(())
}
