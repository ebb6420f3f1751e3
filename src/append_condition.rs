use crate::query::Query;

/// DCB optimistic-concurrency guard.
///
/// An append holding this condition succeeds only if no event matching
/// `fail_if_events_match` exists at a position greater than
/// `after_sequence_position` (or at all, when that is `None`).
#[derive(Debug, Clone)]
pub struct AppendCondition {
    pub fail_if_events_match: Query,
    pub after_sequence_position: Option<i64>,
}

impl AppendCondition {
    pub fn new(fail_if_events_match: Query, after_sequence_position: Option<i64>) -> Self {
        Self {
            fail_if_events_match,
            after_sequence_position,
        }
    }
}
