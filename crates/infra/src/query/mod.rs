//! Filtered, cursor-paginated listing.
//!
//! A small filter language checked against per-entity allow-lists, plus
//! opaque cursor tokens. Both backends share the schemas below: Postgres
//! translates them to SQL, the in-memory backend evaluates them directly.

pub mod cursor;
pub mod filter;

pub use cursor::{Cursor, DEFAULT_PAGE_SIZE, Direction, ListQuery, MAX_PAGE_SIZE, Page, SortKey, build_page};
pub use filter::{CompareOp, FieldKind, FieldSpec, FieldValue, Filter, Filterable, QuerySchema};

/// Derived status of a payment/order row (see the ledger's lateral join).
pub(crate) const LATEST_STATUS_COLUMN: &str = "COALESCE(latest.status, 'PENDING')";

pub const PAYMENT_SCHEMA: QuerySchema = QuerySchema {
    entity: "payments",
    fields: &[
        FieldSpec { key: "id", column: "p.id", kind: FieldKind::Uuid },
        FieldSpec { key: "reference", column: "p.reference", kind: FieldKind::Text },
        FieldSpec { key: "connector_id", column: "p.connector_id", kind: FieldKind::Uuid },
        FieldSpec { key: "type", column: "p.type", kind: FieldKind::Text },
        FieldSpec { key: "asset", column: "p.asset", kind: FieldKind::Text },
        FieldSpec { key: "scheme", column: "p.scheme", kind: FieldKind::Text },
        FieldSpec { key: "status", column: LATEST_STATUS_COLUMN, kind: FieldKind::Text },
        FieldSpec { key: "source_account_id", column: "p.source_account_id", kind: FieldKind::Uuid },
        FieldSpec { key: "destination_account_id", column: "p.destination_account_id", kind: FieldKind::Uuid },
        FieldSpec { key: "amount", column: "p.amount", kind: FieldKind::Decimal },
        FieldSpec { key: "initial_amount", column: "p.initial_amount", kind: FieldKind::Decimal },
    ],
    metadata_column: Some("p.metadata"),
};

pub const ORDER_SCHEMA: QuerySchema = QuerySchema {
    entity: "orders",
    fields: &[
        FieldSpec { key: "id", column: "o.id", kind: FieldKind::Uuid },
        FieldSpec { key: "reference", column: "o.reference", kind: FieldKind::Text },
        FieldSpec { key: "connector_id", column: "o.connector_id", kind: FieldKind::Uuid },
        FieldSpec { key: "type", column: "o.type", kind: FieldKind::Text },
        FieldSpec { key: "direction", column: "o.direction", kind: FieldKind::Text },
        FieldSpec { key: "source_asset", column: "o.source_asset", kind: FieldKind::Text },
        FieldSpec { key: "target_asset", column: "o.target_asset", kind: FieldKind::Text },
        FieldSpec { key: "status", column: LATEST_STATUS_COLUMN, kind: FieldKind::Text },
        FieldSpec { key: "amount", column: "o.amount", kind: FieldKind::Decimal },
        FieldSpec { key: "initial_amount", column: "o.initial_amount", kind: FieldKind::Decimal },
    ],
    metadata_column: Some("o.metadata"),
};
