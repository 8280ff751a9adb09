//! Reference data owned by plain CRUD collaborators.
//!
//! Only the fields foreign keys and outbox payloads need are modelled here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AccountId, ConnectorId};
use crate::time::normalize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub id: ConnectorId,
    pub name: String,
    /// Provider slug, e.g. `stripe`.
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

impl Connector {
    pub fn new(
        id: ConnectorId,
        name: impl Into<String>,
        provider: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            provider: provider.into(),
            created_at: normalize(created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub connector_id: ConnectorId,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub name: Option<String>,
    pub default_asset: Option<String>,
}

impl Account {
    pub fn new(connector_id: ConnectorId, reference: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        let reference = reference.into();
        Self {
            id: AccountId::derive(connector_id, &reference),
            connector_id,
            reference,
            created_at: normalize(created_at),
            name: None,
            default_asset: None,
        }
    }
}
