//! Queries over one table.
//!
//! A [`Query`] is a plain expression tree. [`compile`] checks it against the
//! schema once, resolving every property through the descriptor table, and
//! produces a [`CompiledQuery`] that can be evaluated against any snapshot.

use crate::{error::Result, Error, ObjectId, ObjectSchema, PropertyType, Record, Schema, Snapshot, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn is_ordered(&self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

/// A predicate expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expr {
    /// Matches everything
    True,
    Compare {
        property: String,
        op: CompareOp,
        value: Value,
    },
    /// Case-sensitive substring match on a string property
    Contains { property: String, needle: String },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    fn compare(property: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Expr::Compare {
            property: property.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Eq, value)
    }

    pub fn ne(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Ne, value)
    }

    pub fn gt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Gt, value)
    }

    pub fn ge(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Ge, value)
    }

    pub fn lt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Lt, value)
    }

    pub fn le(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Le, value)
    }

    pub fn contains(property: impl Into<String>, needle: impl Into<String>) -> Self {
        Expr::Contains {
            property: property.into(),
            needle: needle.into(),
        }
    }

    pub fn and(self, other: Expr) -> Self {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Self {
        Expr::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }
}

/// Sort order for query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortDescriptor {
    pub property: String,
    pub ascending: bool,
}

/// A query over one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub table: TableName,
    pub predicate: Expr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortDescriptor>,
}

impl Query {
    /// Every object of `table`, in insertion order.
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            predicate: Expr::True,
            sort: None,
        }
    }

    /// Narrow the query. Successive filters are combined with `and`.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.predicate = match self.predicate {
            Expr::True => expr,
            existing => existing.and(expr),
        };
        self
    }

    /// Order results by a property.
    pub fn sorted_by(mut self, property: impl Into<String>, ascending: bool) -> Self {
        self.sort = Some(SortDescriptor {
            property: property.into(),
            ascending,
        });
        self
    }
}

#[derive(Debug, Clone)]
enum Predicate {
    True,
    Compare {
        property: String,
        op: CompareOp,
        value: Value,
    },
    Contains {
        property: String,
        needle: String,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

#[derive(Debug, Clone)]
struct CompiledQueryInner {
    query: Query,
    predicate: Predicate,
    sort: Option<(usize, SortDescriptor)>,
    properties: Vec<usize>,
    fingerprint: String,
}

/// A query checked against the schema, ready to evaluate.
///
/// Two compiled queries are equal when their canonical fingerprints are.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    inner: Arc<CompiledQueryInner>,
}

impl CompiledQuery {
    /// The source query.
    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    /// The table the query reads.
    pub fn table(&self) -> &str {
        &self.inner.query.table
    }

    /// Canonical text of the query.
    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    /// Descriptor indices of every property the query reads.
    pub fn properties(&self) -> &[usize] {
        &self.inner.properties
    }

    /// Whether a record matches the predicate.
    pub fn matches(&self, snapshot: &Snapshot, record: &Record) -> bool {
        eval(&self.inner.predicate, snapshot, record)
    }

    /// Matching objects, ordered by the sort descriptor. Ties and unsorted
    /// results keep insertion order.
    pub fn evaluate(&self, snapshot: &Snapshot) -> Vec<ObjectId> {
        let mut matched: Vec<&Arc<Record>> = snapshot
            .records(self.table())
            .into_iter()
            .filter(|r| self.matches(snapshot, r))
            .collect();

        if let Some((_, sort)) = &self.inner.sort {
            matched.sort_by(|a, b| {
                let left = read(snapshot, a, &sort.property);
                let right = read(snapshot, b, &sort.property);
                sort_order(&left, &right, sort.ascending)
            });
        }

        matched.into_iter().map(|r| r.id.clone()).collect()
    }
}

impl PartialEq for CompiledQuery {
    fn eq(&self, other: &Self) -> bool {
        self.inner.fingerprint == other.inner.fingerprint
    }
}

impl Eq for CompiledQuery {}

impl Hash for CompiledQuery {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.fingerprint.hash(state);
    }
}

/// Check a query against the schema.
pub fn compile(schema: &Schema, query: &Query) -> Result<CompiledQuery> {
    let object_schema = schema.require(&query.table)?;
    let mut properties = Vec::new();
    let predicate = compile_expr(object_schema, &query.predicate, &mut properties)?;

    let sort = match &query.sort {
        Some(sort) => {
            let index = resolve(object_schema, &sort.property, &mut properties)?;
            let descriptor = &object_schema.properties[index];
            if !descriptor.property_type.is_ordered() && descriptor.property_type != PropertyType::Bool {
                return Err(Error::InvalidQuery(format!(
                    "cannot sort by {} property '{}'",
                    descriptor.property_type, sort.property
                )));
            }
            Some((index, sort.clone()))
        }
        None => None,
    };

    properties.sort_unstable();
    properties.dedup();

    let fingerprint = serde_json::to_string(query)
        .map_err(|e| Error::InvalidQuery(format!("cannot fingerprint query: {e}")))?;

    Ok(CompiledQuery {
        inner: Arc::new(CompiledQueryInner {
            query: query.clone(),
            predicate,
            sort,
            properties,
            fingerprint,
        }),
    })
}

fn resolve(object_schema: &ObjectSchema, property: &str, used: &mut Vec<usize>) -> Result<usize> {
    let index = object_schema
        .property_index(property)
        .ok_or_else(|| Error::UnknownProperty {
            table: object_schema.name.clone(),
            property: property.to_string(),
        })?;
    used.push(index);
    Ok(index)
}

fn compile_expr(object_schema: &ObjectSchema, expr: &Expr, used: &mut Vec<usize>) -> Result<Predicate> {
    Ok(match expr {
        Expr::True => Predicate::True,
        Expr::Compare {
            property,
            op,
            value,
        } => {
            let index = resolve(object_schema, property, used)?;
            let descriptor = &object_schema.properties[index];
            if op.is_ordered() && !descriptor.property_type.is_ordered() {
                return Err(Error::InvalidQuery(format!(
                    "ordered comparison on {} property '{}'",
                    descriptor.property_type, property
                )));
            }
            if !value.is_null() {
                descriptor
                    .validate(Some(value))
                    .map_err(|e| Error::InvalidQuery(e.to_string()))?;
            } else if op.is_ordered() {
                return Err(Error::InvalidQuery(format!(
                    "ordered comparison with null on '{property}'"
                )));
            }
            Predicate::Compare {
                property: property.clone(),
                op: *op,
                value: value.clone(),
            }
        }
        Expr::Contains { property, needle } => {
            let index = resolve(object_schema, property, used)?;
            let descriptor = &object_schema.properties[index];
            if descriptor.property_type != PropertyType::String {
                return Err(Error::InvalidQuery(format!(
                    "contains on {} property '{}'",
                    descriptor.property_type, property
                )));
            }
            Predicate::Contains {
                property: property.clone(),
                needle: needle.clone(),
            }
        }
        Expr::And(a, b) => Predicate::And(
            Box::new(compile_expr(object_schema, a, used)?),
            Box::new(compile_expr(object_schema, b, used)?),
        ),
        Expr::Or(a, b) => Predicate::Or(
            Box::new(compile_expr(object_schema, a, used)?),
            Box::new(compile_expr(object_schema, b, used)?),
        ),
        Expr::Not(a) => Predicate::Not(Box::new(compile_expr(object_schema, a, used)?)),
    })
}

fn read(snapshot: &Snapshot, record: &Record, property: &str) -> Value {
    record.get(property).cloned().unwrap_or_else(|| {
        snapshot
            .schema()
            .get_object(&record.id.table)
            .and_then(|s| s.descriptor(property))
            .map(|d| d.default_value())
            .unwrap_or(Value::Null)
    })
}

fn eval(predicate: &Predicate, snapshot: &Snapshot, record: &Record) -> bool {
    match predicate {
        Predicate::True => true,
        Predicate::Compare {
            property,
            op,
            value,
        } => {
            let actual = read(snapshot, record, property);
            match op {
                CompareOp::Eq => values_equal(&actual, value),
                CompareOp::Ne => !values_equal(&actual, value),
                CompareOp::Gt => compare_values(&actual, value) == Some(Ordering::Greater),
                CompareOp::Ge => matches!(
                    compare_values(&actual, value),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
                CompareOp::Lt => compare_values(&actual, value) == Some(Ordering::Less),
                CompareOp::Le => matches!(
                    compare_values(&actual, value),
                    Some(Ordering::Less | Ordering::Equal)
                ),
            }
        }
        Predicate::Contains { property, needle } => read(snapshot, record, property)
            .as_str()
            .is_some_and(|s| s.contains(needle.as_str())),
        Predicate::And(a, b) => eval(a, snapshot, record) && eval(b, snapshot, record),
        Predicate::Or(a, b) => eval(a, snapshot, record) || eval(b, snapshot, record),
        Predicate::Not(a) => !eval(a, snapshot, record),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// Nulls sort last in both directions.
fn sort_order(a: &Value, b: &Value, ascending: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ordering = compare_values(a, b).unwrap_or(Ordering::Equal);
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        }
    }
}
