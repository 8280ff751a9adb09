//! Temporal balance versions.
//!
//! Per (account, asset) the store keeps a totally ordered list of versions.
//! Each version is valid over its coverage window
//! `[created_at, last_updated_at]`; windows never overlap. The head version
//! (the newest one) stays the account's value until a newer observation
//! supersedes it, so its window is open-ended for point-in-time reads.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{AccountId, ConnectorId};
use crate::time::normalize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: AccountId,
    pub asset: String,
    pub connector_id: ConnectorId,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Balance {
    /// A balance observed at a single instant.
    pub fn observed(
        account_id: AccountId,
        connector_id: ConnectorId,
        asset: impl Into<String>,
        balance: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        let at = normalize(at);
        Self {
            account_id,
            asset: asset.into(),
            connector_id,
            balance,
            created_at: at,
            last_updated_at: at,
        }
    }

    /// Whether `at` falls inside this version's coverage window.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.created_at <= at && at <= self.last_updated_at
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.asset.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "balance for account {}: missing asset",
                self.account_id
            )));
        }
        if self.last_updated_at < self.created_at {
            return Err(DomainError::validation(format!(
                "balance for account {}: window ends before it starts",
                self.account_id
            )));
        }
        Ok(())
    }
}

/// What to do with an observation given the latest stored version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionDecision {
    /// No version yet: store the observation.
    Insert,
    /// Strictly older than the latest version: no-op.
    Discard,
    /// Same value: extend the latest window to `last_updated_at`.
    Extend { last_updated_at: DateTime<Utc> },
    /// Newer, different value: close the latest window at the observation's
    /// `created_at`, then store the observation.
    Supersede { close_at: DateTime<Utc> },
    /// Same `created_at`, different value: the provider corrected itself.
    /// The latest version's value is replaced in place.
    Correct,
}

impl VersionDecision {
    /// Whether the decision modifies a stored version and is announced
    /// downstream. Only a discarded observation leaves the store untouched.
    pub fn is_announced(&self) -> bool {
        !matches!(self, VersionDecision::Discard)
    }

    pub fn decide(latest: Option<&Balance>, observed: &Balance) -> Self {
        let Some(latest) = latest else {
            return VersionDecision::Insert;
        };

        if latest.created_at > observed.created_at {
            return VersionDecision::Discard;
        }

        if latest.balance == observed.balance {
            return VersionDecision::Extend {
                last_updated_at: latest.last_updated_at.max(observed.last_updated_at),
            };
        }

        if latest.created_at == observed.created_at {
            VersionDecision::Correct
        } else {
            VersionDecision::Supersede {
                close_at: observed.created_at,
            }
        }
    }
}

/// Select the version valid at `at` among the versions of one (account, asset).
///
/// `versions` must be ordered oldest first.
pub fn version_at(versions: &[Balance], at: DateTime<Utc>) -> Option<&Balance> {
    let position = versions.iter().rposition(|v| v.created_at <= at)?;
    let candidate = &versions[position];
    let is_head = position + 1 == versions.len();
    (is_head || candidate.covers(at)).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn test_balance(amount: Decimal, offset_secs: i64) -> Balance {
        Balance::observed(
            AccountId::from_uuid(Uuid::from_u128(1)),
            ConnectorId::from_uuid(Uuid::from_u128(2)),
            "USD/2",
            amount,
            test_time() + Duration::seconds(offset_secs),
        )
    }

    /// Apply the decision to a plain list of versions, oldest first.
    fn apply(versions: &mut Vec<Balance>, observed: Balance) -> VersionDecision {
        let decision = VersionDecision::decide(versions.last(), &observed);
        match &decision {
            VersionDecision::Insert => versions.push(observed),
            VersionDecision::Discard => {}
            VersionDecision::Extend { last_updated_at } => {
                if let Some(latest) = versions.last_mut() {
                    latest.last_updated_at = *last_updated_at;
                }
            }
            VersionDecision::Supersede { close_at } => {
                if let Some(latest) = versions.last_mut() {
                    latest.last_updated_at = *close_at;
                }
                versions.push(observed);
            }
            VersionDecision::Correct => {
                if let Some(latest) = versions.last_mut() {
                    latest.balance = observed.balance;
                }
            }
        }
        decision
    }

    #[test]
    fn coalesce_then_supersede_scenario() {
        let mut versions = Vec::new();
        assert_eq!(apply(&mut versions, test_balance(dec!(100), 0)), VersionDecision::Insert);
        apply(&mut versions, test_balance(dec!(100), 10));
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].last_updated_at, test_time() + Duration::seconds(10));

        apply(&mut versions, test_balance(dec!(200), 20));
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].last_updated_at, test_time() + Duration::seconds(20));

        let at = |s: i64| test_time() + Duration::seconds(s);
        assert_eq!(version_at(&versions, at(5)).map(|v| v.balance), Some(dec!(100)));
        assert_eq!(version_at(&versions, at(21)).map(|v| v.balance), Some(dec!(200)));
        assert_eq!(version_at(&versions, at(20)).map(|v| v.balance), Some(dec!(200)));
        assert_eq!(version_at(&versions, at(-1)), None);
    }

    #[test]
    fn strictly_older_observation_is_discarded() {
        let latest = test_balance(dec!(100), 10);
        assert_eq!(
            VersionDecision::decide(Some(&latest), &test_balance(dec!(50), 5)),
            VersionDecision::Discard
        );
    }

    #[test]
    fn same_instant_different_value_is_a_correction() {
        let latest = test_balance(dec!(100), 10);
        assert_eq!(
            VersionDecision::decide(Some(&latest), &test_balance(dec!(90), 10)),
            VersionDecision::Correct
        );
    }

    #[test]
    fn every_stored_observation_is_announced() {
        let latest = test_balance(dec!(100), 10);
        let announced = |observed: Balance| VersionDecision::decide(Some(&latest), &observed).is_announced();

        assert!(announced(test_balance(dec!(100), 20)));
        assert!(announced(test_balance(dec!(200), 20)));
        assert!(announced(test_balance(dec!(90), 10)));
        assert!(!announced(test_balance(dec!(100), 5)));
        assert!(VersionDecision::decide(None, &latest).is_announced());
    }

    #[test]
    fn extend_never_shrinks_the_window() {
        let mut latest = test_balance(dec!(100), 0);
        latest.last_updated_at = test_time() + Duration::seconds(30);
        assert_eq!(
            VersionDecision::decide(Some(&latest), &test_balance(dec!(100), 10)),
            VersionDecision::Extend {
                last_updated_at: test_time() + Duration::seconds(30)
            }
        );
    }

    #[test]
    fn gap_between_versions_is_not_extrapolated() {
        let mut first = test_balance(dec!(100), 0);
        first.last_updated_at = test_time() + Duration::seconds(5);
        let second = test_balance(dec!(300), 10);
        let versions = vec![first, second];

        assert_eq!(version_at(&versions, test_time() + Duration::seconds(7)), None);
        assert_eq!(
            version_at(&versions, test_time() + Duration::seconds(5)).map(|v| v.balance),
            Some(dec!(100))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: windows stay ordered and non-overlapping.
        #[test]
        fn windows_are_ordered_and_disjoint(
            observations in prop::collection::vec((0i64..500, 0i64..3), 1..40)
        ) {
            let mut versions = Vec::new();
            for (offset, value) in observations {
                apply(&mut versions, test_balance(Decimal::from(value), offset));
            }

            for pair in versions.windows(2) {
                prop_assert!(pair[0].created_at < pair[1].created_at);
                prop_assert!(pair[0].last_updated_at <= pair[1].created_at);
            }
            for v in &versions {
                prop_assert!(v.created_at <= v.last_updated_at);
            }
        }
    }
}
