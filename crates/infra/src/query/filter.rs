//! Filter expressions and per-entity allow-lists.
//!
//! Filters arrive as JSON:
//!
//! ```text
//! {"$and": [
//!     {"$match": {"connector_id": "…"}},
//!     {"$gte": {"amount": "100"}},
//!     {"$match": {"metadata[order]": "42"}}
//! ]}
//! ```
//!
//! Every (key, operator) pair is checked against the entity's
//! [`QuerySchema`] before it reaches a backend.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::storage::StorageError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    fn sql(&self) -> &'static str {
        match self {
            CompareOp::Lt => " < ",
            CompareOp::Lte => " <= ",
            CompareOp::Gt => " > ",
            CompareOp::Gte => " >= ",
        }
    }

    fn holds(&self, left: Decimal, right: Decimal) -> bool {
        match self {
            CompareOp::Lt => left < right,
            CompareOp::Lte => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Gte => left >= right,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Match { key: String, value: Value },
    Compare { key: String, op: CompareOp, value: Value },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn matching(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Match {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn compare(key: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Filter::Compare {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    /// Parse the JSON filter representation.
    pub fn from_json(value: &Value) -> Result<Self, StorageError> {
        let object = value
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| StorageError::validation("filter must be an object with one operator"))?;
        let (operator, operand) = object
            .iter()
            .next()
            .ok_or_else(|| StorageError::validation("empty filter"))?;

        match operator.as_str() {
            "$and" | "$or" => {
                let items = operand
                    .as_array()
                    .ok_or_else(|| StorageError::validation(format!("{operator} expects an array")))?
                    .iter()
                    .map(Filter::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if operator == "$and" {
                    Filter::And(items)
                } else {
                    Filter::Or(items)
                })
            }
            "$not" => Ok(Filter::Not(Box::new(Filter::from_json(operand)?))),
            "$match" | "$lt" | "$lte" | "$gt" | "$gte" => {
                let (key, value) = single_pair(operator, operand)?;
                Ok(match operator.as_str() {
                    "$match" => Filter::Match { key, value },
                    "$lt" => Filter::Compare { key, op: CompareOp::Lt, value },
                    "$lte" => Filter::Compare { key, op: CompareOp::Lte, value },
                    "$gt" => Filter::Compare { key, op: CompareOp::Gt, value },
                    _ => Filter::Compare { key, op: CompareOp::Gte, value },
                })
            }
            other => Err(StorageError::validation(format!("unknown operator {other}"))),
        }
    }
}

fn single_pair(operator: &str, operand: &Value) -> Result<(String, Value), StorageError> {
    let object = operand
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| StorageError::validation(format!("{operator} expects one key/value pair")))?;
    object
        .iter()
        .next()
        .map(|(k, v)| (k.clone(), v.clone()))
        .ok_or_else(|| StorageError::validation(format!("{operator} expects one key/value pair")))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Exact match only.
    Text,
    /// Exact match only, value must parse as a UUID.
    Uuid,
    /// Match and comparisons.
    Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    /// SQL expression the key translates to.
    pub column: &'static str,
    pub kind: FieldKind,
}

/// Allow-list of filterable keys for one entity.
#[derive(Debug, Clone, Copy)]
pub struct QuerySchema {
    pub entity: &'static str,
    pub fields: &'static [FieldSpec],
    /// JSONB column backing `metadata[<key>]` filters, if supported.
    pub metadata_column: Option<&'static str>,
}

/// A filter operand after validation.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Text(String),
    Uuid(Uuid),
    Decimal(Decimal),
}

enum Target<'a> {
    Field(&'a FieldSpec),
    Metadata(String),
}

impl QuerySchema {
    fn resolve(&self, key: &str) -> Result<Target<'_>, StorageError> {
        if let Some(inner) = key
            .strip_prefix("metadata[")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            if self.metadata_column.is_some() && !inner.is_empty() {
                return Ok(Target::Metadata(inner.to_string()));
            }
        }
        self.fields
            .iter()
            .find(|f| f.key == key)
            .map(Target::Field)
            .ok_or_else(|| {
                StorageError::validation(format!("unknown key {key:?} for {}", self.entity))
            })
    }

    fn operand(&self, key: &str, kind: FieldKind, value: &Value) -> Result<Operand, StorageError> {
        let invalid = || StorageError::validation(format!("invalid value {value} for key {key:?}"));
        match kind {
            FieldKind::Text => value.as_str().map(|s| Operand::Text(s.to_string())).ok_or_else(invalid),
            FieldKind::Uuid => value
                .as_str()
                .and_then(|s| Uuid::from_str(s).ok())
                .map(Operand::Uuid)
                .ok_or_else(invalid),
            FieldKind::Decimal => match value {
                Value::String(s) => Decimal::from_str(s).ok(),
                Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
                _ => None,
            }
            .map(Operand::Decimal)
            .ok_or_else(invalid),
        }
    }

    /// Reject keys/operators outside the allow-list.
    pub fn validate(&self, filter: &Filter) -> Result<(), StorageError> {
        match filter {
            Filter::And(items) | Filter::Or(items) => {
                items.iter().try_for_each(|f| self.validate(f))
            }
            Filter::Not(inner) => self.validate(inner),
            Filter::Match { key, value } => match self.resolve(key)? {
                Target::Field(field) => self.operand(key, field.kind, value).map(|_| ()),
                Target::Metadata(_) => self.operand(key, FieldKind::Text, value).map(|_| ()),
            },
            Filter::Compare { key, value, .. } => match self.resolve(key)? {
                Target::Field(field) if field.kind == FieldKind::Decimal => {
                    self.operand(key, FieldKind::Decimal, value).map(|_| ())
                }
                _ => Err(StorageError::validation(format!(
                    "key {key:?} of {} does not support comparisons",
                    self.entity
                ))),
            },
        }
    }

    /// Append the SQL translation of `filter` to `builder`.
    ///
    /// `validate` must have accepted the filter.
    pub(crate) fn push_sql(
        &self,
        builder: &mut QueryBuilder<'_, Postgres>,
        filter: &Filter,
    ) -> Result<(), StorageError> {
        match filter {
            Filter::And(items) | Filter::Or(items) => {
                if items.is_empty() {
                    builder.push(if matches!(filter, Filter::And(_)) { "TRUE" } else { "FALSE" });
                    return Ok(());
                }
                let joiner = if matches!(filter, Filter::And(_)) { " AND " } else { " OR " };
                builder.push("(");
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        builder.push(joiner);
                    }
                    self.push_sql(builder, item)?;
                }
                builder.push(")");
            }
            Filter::Not(inner) => {
                builder.push("NOT (");
                self.push_sql(builder, inner)?;
                builder.push(")");
            }
            Filter::Match { key, value } => match self.resolve(key)? {
                Target::Field(field) => {
                    builder.push(field.column).push(" = ");
                    push_operand(builder, self.operand(key, field.kind, value)?);
                }
                Target::Metadata(meta_key) => {
                    let column = self.metadata_column.unwrap_or("metadata");
                    builder.push(column).push(" ->> ");
                    builder.push_bind(meta_key);
                    builder.push(" = ");
                    push_operand(builder, self.operand(key, FieldKind::Text, value)?);
                }
            },
            Filter::Compare { key, op, value } => match self.resolve(key)? {
                Target::Field(field) => {
                    builder.push(field.column).push(op.sql());
                    push_operand(builder, self.operand(key, FieldKind::Decimal, value)?);
                }
                Target::Metadata(_) => {
                    return Err(StorageError::validation(format!(
                        "key {key:?} does not support comparisons"
                    )));
                }
            },
        }
        Ok(())
    }

    /// Evaluate `filter` against an in-memory record.
    pub(crate) fn evaluate(&self, filter: &Filter, record: &dyn Filterable) -> Result<bool, StorageError> {
        Ok(match filter {
            Filter::And(items) => {
                for item in items {
                    if !self.evaluate(item, record)? {
                        return Ok(false);
                    }
                }
                true
            }
            Filter::Or(items) => {
                for item in items {
                    if self.evaluate(item, record)? {
                        return Ok(true);
                    }
                }
                false
            }
            Filter::Not(inner) => !self.evaluate(inner, record)?,
            Filter::Match { key, value } => match self.resolve(key)? {
                Target::Field(field) => {
                    let expected = self.operand(key, field.kind, value)?;
                    record
                        .field(field.key)
                        .is_some_and(|actual| actual.equals(&expected))
                }
                Target::Metadata(meta_key) => {
                    let expected = self.operand(key, FieldKind::Text, value)?;
                    record
                        .metadata(&meta_key)
                        .is_some_and(|actual| Operand::Text(actual.to_string()) == expected)
                }
            },
            Filter::Compare { key, op, value } => {
                let Operand::Decimal(right) = self.operand(key, FieldKind::Decimal, value)? else {
                    return Ok(false);
                };
                match self.resolve(key)? {
                    Target::Field(field) => match record.field(field.key) {
                        Some(FieldValue::Decimal(left)) => op.holds(left, right),
                        _ => false,
                    },
                    Target::Metadata(_) => false,
                }
            }
        })
    }
}

fn push_operand(builder: &mut QueryBuilder<'_, Postgres>, operand: Operand) {
    match operand {
        Operand::Text(s) => builder.push_bind(s),
        Operand::Uuid(u) => builder.push_bind(u),
        Operand::Decimal(d) => builder.push_bind(d),
    };
}

/// Value of a record field for in-memory filtering.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Uuid(Uuid),
    Decimal(Decimal),
}

impl FieldValue {
    fn equals(&self, operand: &Operand) -> bool {
        match (self, operand) {
            (FieldValue::Text(a), Operand::Text(b)) => a == b,
            (FieldValue::Uuid(a), Operand::Uuid(b)) => a == b,
            (FieldValue::Decimal(a), Operand::Decimal(b)) => a == b,
            _ => false,
        }
    }
}

/// A record that in-memory backends can filter.
pub trait Filterable {
    fn field(&self, key: &str) -> Option<FieldValue>;

    fn metadata(&self, key: &str) -> Option<&str>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use serde_json::json;

    const TEST_SCHEMA: QuerySchema = QuerySchema {
        entity: "widget",
        fields: &[
            FieldSpec { key: "reference", column: "w.reference", kind: FieldKind::Text },
            FieldSpec { key: "id", column: "w.id", kind: FieldKind::Uuid },
            FieldSpec { key: "amount", column: "w.amount", kind: FieldKind::Decimal },
        ],
        metadata_column: Some("w.metadata"),
    };

    struct Widget {
        reference: String,
        amount: Decimal,
        metadata: BTreeMap<String, String>,
    }

    impl Filterable for Widget {
        fn field(&self, key: &str) -> Option<FieldValue> {
            match key {
                "reference" => Some(FieldValue::Text(self.reference.clone())),
                "amount" => Some(FieldValue::Decimal(self.amount)),
                _ => None,
            }
        }

        fn metadata(&self, key: &str) -> Option<&str> {
            self.metadata.get(key).map(String::as_str)
        }
    }

    fn test_widget() -> Widget {
        Widget {
            reference: "w1".to_string(),
            amount: Decimal::from(150),
            metadata: BTreeMap::from([("team".to_string(), "ops".to_string())]),
        }
    }

    #[test]
    fn parses_nested_json() {
        let filter = Filter::from_json(&json!({
            "$and": [
                {"$match": {"reference": "w1"}},
                {"$not": {"$lt": {"amount": 100}}}
            ]
        }))
        .unwrap();

        assert_eq!(
            filter,
            Filter::And(vec![
                Filter::matching("reference", "w1"),
                Filter::Not(Box::new(Filter::compare("amount", CompareOp::Lt, 100))),
            ])
        );
    }

    #[test]
    fn unknown_operator_and_key_are_validation_errors() {
        assert!(matches!(
            Filter::from_json(&json!({"$like": {"reference": "w%"}})),
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            TEST_SCHEMA.validate(&Filter::matching("colour", "red")),
            Err(StorageError::Validation(_))
        ));
    }

    #[test]
    fn comparisons_only_on_decimal_keys() {
        assert!(TEST_SCHEMA.validate(&Filter::compare("amount", CompareOp::Gte, "10")).is_ok());
        assert!(TEST_SCHEMA.validate(&Filter::compare("reference", CompareOp::Gt, "a")).is_err());
        assert!(TEST_SCHEMA.validate(&Filter::compare("metadata[team]", CompareOp::Gt, "a")).is_err());
        assert!(TEST_SCHEMA.validate(&Filter::matching("id", "not-a-uuid")).is_err());
    }

    #[test]
    fn evaluates_in_memory() {
        let widget = test_widget();
        let cases = [
            (Filter::matching("reference", "w1"), true),
            (Filter::matching("metadata[team]", "ops"), true),
            (Filter::matching("metadata[team]", "dev"), false),
            (Filter::compare("amount", CompareOp::Gt, "149.99"), true),
            (Filter::compare("amount", CompareOp::Lt, 150), false),
            (
                Filter::Or(vec![
                    Filter::matching("reference", "nope"),
                    Filter::compare("amount", CompareOp::Lte, 150),
                ]),
                true,
            ),
            (Filter::Not(Box::new(Filter::matching("reference", "w1"))), false),
            (Filter::Or(vec![]), false),
            (Filter::And(vec![]), true),
        ];

        for (filter, expected) in cases {
            assert_eq!(TEST_SCHEMA.evaluate(&filter, &widget).unwrap(), expected, "{filter:?}");
        }
    }

    #[test]
    fn translates_to_sql() {
        let filter = Filter::And(vec![
            Filter::matching("reference", "w1"),
            Filter::matching("metadata[team]", "ops"),
            Filter::compare("amount", CompareOp::Gte, "10"),
        ]);
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM widgets w WHERE ");
        TEST_SCHEMA.push_sql(&mut builder, &filter).unwrap();

        assert_eq!(
            builder.sql(),
            "SELECT * FROM widgets w WHERE (w.reference = $1 AND w.metadata ->> $2 = $3 AND w.amount >= $4)"
        );
    }
}
