use chrono::{NaiveDate, NaiveTime};

use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Calendar dates must start inside the valid timestamp range.
pub(crate) fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    use crate::limits::*;
    let midnight = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&midnight) {
        return Err(EngineError::Invalid("date out of range"));
    }
    Ok(())
}

/// Fail with the first confirmed booking overlapping `span`.
/// Caller must hold the staff member's write lock for the result to mean anything.
pub(crate) fn check_no_conflict(st: &StaffState, span: &Span) -> Result<(), EngineError> {
    match st.overlapping(span).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
