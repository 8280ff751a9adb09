//! Timestamp normalisation.

use chrono::{DateTime, SubsecRound, Utc};

/// Truncate to microseconds, the precision of the relational store.
///
/// Identity derivation and version comparisons must see the same instant
/// before and after a round trip through storage.
pub fn normalize(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}
