//! Composable, typed filter and update builders for store queries.
//!
//! A [`Filter`] is built against an entity's [`QueryFields`] schema and
//! validated when the store compiles it: unknown fields and values that
//! cannot be coerced to the field's kind fail with a [`FilterError`]
//! naming the offending field. Coercion produces [`Scalar`] values the
//! storage layer binds directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The kinds a query field can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Uuid,
    Int64,
    Time,
    Bool,
}

/// One queryable field of an entity.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// An entity's queryable schema.
pub type QueryFields = &'static [FieldDef];

/// Typed failures building or compiling a filter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    /// The field is not part of the entity's query schema.
    #[error("unknown query field '{field}'")]
    UnknownField {
        /// The offending field name.
        field: String,
    },

    /// The supplied value cannot be coerced to the field's kind.
    #[error("value of incompatible type supplied for field '{field}'")]
    FieldType {
        /// The offending field name.
        field: String,
    },
}

/// A caller-supplied comparison value, coerced per field kind when the
/// filter is compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    String(String),
    Uuid(Uuid),
    Int64(i64),
    Time(DateTime<Utc>),
    Bool(bool),
    /// Arbitrary JSON; only scalar shapes coerce successfully.
    Json(serde_json::Value),
    Null,
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Uuid> for FilterValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<u64> for FilterValue {
    fn from(v: u64) -> Self {
        Self::Int64(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Time(v)
    }
}

impl From<serde_json::Value> for FilterValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// A coerced scalar ready for parameter binding.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Int(i64),
    Null,
}

impl FilterValue {
    /// Coerces the value to a field kind.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` when the value has no sensible representation in
    /// that kind; the caller attaches the field name.
    pub fn coerce(&self, kind: FieldKind) -> Result<Scalar, ()> {
        match (kind, self) {
            (_, Self::Null) => Ok(Scalar::Null),
            (_, Self::Json(v)) => Self::coerce_json(kind, v),

            (FieldKind::String, Self::String(s)) => Ok(Scalar::Text(s.clone())),
            (FieldKind::String, Self::Uuid(u)) => Ok(Scalar::Text(u.to_string())),
            (FieldKind::String, Self::Int64(n)) => Ok(Scalar::Text(n.to_string())),

            (FieldKind::Uuid, Self::Uuid(u)) => Ok(Scalar::Text(u.to_string())),
            (FieldKind::Uuid, Self::String(s)) => Uuid::parse_str(s)
                .map(|u| Scalar::Text(u.to_string()))
                .map_err(|_| ()),

            (FieldKind::Int64, Self::Int64(n)) => Ok(Scalar::Int(*n)),
            (FieldKind::Int64, Self::String(s)) => {
                s.parse().map(Scalar::Int).map_err(|_| ())
            }

            (FieldKind::Time, Self::Time(t)) => Ok(Scalar::Text(time_text(t))),
            (FieldKind::Time, Self::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| Scalar::Text(time_text(&t.with_timezone(&Utc))))
                .map_err(|_| ()),

            (FieldKind::Bool, Self::Bool(b)) => Ok(Scalar::Int(i64::from(*b))),
            (FieldKind::Bool, Self::String(s)) => match s.as_str() {
                "true" => Ok(Scalar::Int(1)),
                "false" => Ok(Scalar::Int(0)),
                _ => Err(()),
            },

            _ => Err(()),
        }
    }

    fn coerce_json(kind: FieldKind, v: &serde_json::Value) -> Result<Scalar, ()> {
        match v {
            serde_json::Value::Null => Ok(Scalar::Null),
            serde_json::Value::String(s) => FilterValue::String(s.clone()).coerce(kind),
            serde_json::Value::Bool(b) => FilterValue::Bool(*b).coerce(kind),
            serde_json::Value::Number(n) => n
                .as_i64()
                .ok_or(())
                .and_then(|i| FilterValue::Int64(i).coerce(kind)),
            _ => Err(()),
        }
    }
}

/// The canonical text form of a timestamp, identical to the entity serde
/// form so filter matches align with stored rows.
pub fn time_text(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Lt,
    Gt,
}

/// A filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Compare {
        field: String,
        op: Op,
        value: FilterValue,
    },
}

/// Sort direction for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub descending: bool,
}

/// A complete query: expression tree plus ordering and pagination.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    pub root: Option<FilterNode>,
    pub sort: Vec<SortField>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl Filter {
    /// Wraps an expression tree with no ordering or pagination.
    #[must_use]
    pub fn new(root: FilterNode) -> Self {
        Self {
            root: Some(root),
            ..Self::default()
        }
    }

    /// Appends an ascending sort field.
    #[must_use]
    pub fn sort(mut self, field: &str) -> Self {
        self.sort.push(SortField {
            field: field.to_string(),
            descending: false,
        });
        self
    }

    /// Flips the most recently added sort field to descending.
    #[must_use]
    pub fn descending(mut self) -> Self {
        if let Some(last) = self.sort.last_mut() {
            last.descending = true;
        }
        self
    }

    /// Skips the first `n` results.
    #[must_use]
    pub const fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    /// Caps the result count.
    #[must_use]
    pub const fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }
}

/// Builds filter expressions against one entity's schema.
///
/// Field and value validation is deferred to compile time so builder
/// calls stay infallible and chainable.
#[derive(Debug, Clone, Copy)]
pub struct FilterBuilder {
    fields: QueryFields,
}

impl FilterBuilder {
    #[must_use]
    pub const fn new(fields: QueryFields) -> Self {
        Self { fields }
    }

    /// The schema this builder validates against.
    #[must_use]
    pub const fn fields(&self) -> QueryFields {
        self.fields
    }

    #[must_use]
    pub fn eq(&self, field: &str, value: impl Into<FilterValue>) -> FilterNode {
        Self::compare(field, Op::Eq, value)
    }

    #[must_use]
    pub fn neq(&self, field: &str, value: impl Into<FilterValue>) -> FilterNode {
        Self::compare(field, Op::Neq, value)
    }

    #[must_use]
    pub fn lt(&self, field: &str, value: impl Into<FilterValue>) -> FilterNode {
        Self::compare(field, Op::Lt, value)
    }

    #[must_use]
    pub fn gt(&self, field: &str, value: impl Into<FilterValue>) -> FilterNode {
        Self::compare(field, Op::Gt, value)
    }

    #[must_use]
    pub fn and(&self, children: Vec<FilterNode>) -> FilterNode {
        FilterNode::And(children)
    }

    #[must_use]
    pub fn or(&self, children: Vec<FilterNode>) -> FilterNode {
        FilterNode::Or(children)
    }

    fn compare(field: &str, op: Op, value: impl Into<FilterValue>) -> FilterNode {
        FilterNode::Compare {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }
}

/// A field-wise update built with chained `set` calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub ops: Vec<(String, FilterValue)>,
}

impl Update {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `field = value`.
    #[must_use]
    pub fn set(mut self, field: &str, value: impl Into<FilterValue>) -> Self {
        self.ops.push((field.to_string(), value.into()));
        self
    }

    /// True when no ops are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Looks up a field definition by name.
///
/// # Errors
///
/// Returns [`FilterError::UnknownField`] when the schema has no such
/// field.
pub fn field_def(fields: QueryFields, name: &str) -> Result<FieldDef, FilterError> {
    fields
        .iter()
        .find(|f| f.name == name)
        .copied()
        .ok_or_else(|| FilterError::UnknownField {
            field: name.to_string(),
        })
}

/// Coerces a value for a named field.
///
/// # Errors
///
/// Returns [`FilterError::UnknownField`] or [`FilterError::FieldType`]
/// naming the field.
pub fn coerce_field(
    fields: QueryFields,
    name: &str,
    value: &FilterValue,
) -> Result<Scalar, FilterError> {
    let def = field_def(fields, name)?;
    value.coerce(def.kind).map_err(|()| FilterError::FieldType {
        field: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIELDS: QueryFields = &[
        FieldDef {
            name: "name",
            kind: FieldKind::String,
        },
        FieldDef {
            name: "id",
            kind: FieldKind::Uuid,
        },
        FieldDef {
            name: "sequence",
            kind: FieldKind::Int64,
        },
        FieldDef {
            name: "created",
            kind: FieldKind::Time,
        },
    ];

    #[test]
    fn unknown_field_is_named() {
        let err = coerce_field(FIELDS, "bogus", &FilterValue::from("x")).unwrap_err();
        assert_eq!(
            err,
            FilterError::UnknownField {
                field: "bogus".to_string()
            }
        );
    }

    #[test]
    fn incompatible_value_is_named() {
        let map = serde_json::json!({"true": false});
        let err = coerce_field(FIELDS, "name", &FilterValue::from(map)).unwrap_err();
        assert_eq!(
            err,
            FilterError::FieldType {
                field: "name".to_string()
            }
        );
    }

    #[test]
    fn uuid_fields_accept_strings() {
        let id = Uuid::new_v4();
        let scalar = coerce_field(FIELDS, "id", &FilterValue::from(id.to_string())).unwrap();
        assert_eq!(scalar, Scalar::Text(id.to_string()));
        assert!(coerce_field(FIELDS, "id", &FilterValue::from("not-a-uuid")).is_err());
    }

    #[test]
    fn int_fields_accept_numeric_strings() {
        assert_eq!(
            coerce_field(FIELDS, "sequence", &FilterValue::from("42")).unwrap(),
            Scalar::Int(42)
        );
        assert!(coerce_field(FIELDS, "sequence", &FilterValue::from("x")).is_err());
    }

    #[test]
    fn time_fields_accept_rfc3339() {
        let t: DateTime<Utc> = "2021-03-01T09:00:00Z".parse().unwrap();
        let from_time = coerce_field(FIELDS, "created", &FilterValue::from(t)).unwrap();
        let from_text =
            coerce_field(FIELDS, "created", &FilterValue::from("2021-03-01T09:00:00Z")).unwrap();
        assert_eq!(from_time, from_text);
    }

    #[test]
    fn builder_composes_trees() {
        let fb = FilterBuilder::new(FIELDS);
        let node = fb.and(vec![fb.eq("name", "sub1"), fb.gt("sequence", 5i64)]);
        let filter = Filter::new(node).sort("sequence").descending().limit(10);
        assert_eq!(filter.sort.len(), 1);
        assert!(filter.sort[0].descending);
        assert_eq!(filter.limit, Some(10));
    }

    #[test]
    fn update_builder_queues_sets() {
        let update = Update::new().set("name", "after").set("sequence", 9i64);
        assert_eq!(update.ops.len(), 2);
    }
}
