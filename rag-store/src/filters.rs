//! Metadata filters: one conjunction of field predicates.
//!
//! The same [`SearchFilter`] is evaluated in memory (against JSON metadata)
//! and translated to a Qdrant [`Filter`] for the persistent backend.
//!
//! Callers may pass filter hints as JSON:
//! `[{"operator":"match","field":"isAdult","value":false}]`.

use qdrant_client::qdrant::{Condition, Filter, Range};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::errors::RagError;
use crate::record::Metadata;

/// Predicate applied to one metadata field.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterOp {
    /// Exact equality on a boolean/string/integer field.
    Match(Value),
    /// Inclusive numeric bounds; `None` leaves that side open.
    Range { gte: Option<f64>, lte: Option<f64> },
    /// Exact equality on a non-analyzed field (e.g. the chunk index).
    Term(Value),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldPredicate {
    pub field: String,
    pub op: FilterOp,
}

/// Conjunction of predicates. The empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchFilter {
    pub predicates: Vec<FieldPredicate>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(FieldPredicate {
            field: field.into(),
            op: FilterOp::Match(value.into()),
        });
        self
    }

    pub fn range(mut self, field: impl Into<String>, gte: Option<f64>, lte: Option<f64>) -> Self {
        self.predicates.push(FieldPredicate {
            field: field.into(),
            op: FilterOp::Range { gte, lte },
        });
        self
    }

    pub fn term(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(FieldPredicate {
            field: field.into(),
            op: FilterOp::Term(value.into()),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Whether any predicate targets `field`.
    pub fn constrains(&self, field: &str) -> bool {
        self.predicates.iter().any(|p| p.field == field)
    }

    /// Parses caller filter hints from a JSON array of clauses.
    pub fn from_json(raw: &str) -> Result<Self, RagError> {
        serde_json::from_str(raw).map_err(|e| RagError::InvalidArgument(format!("filter: {e}")))
    }

    /// Rejects predicates no backend can evaluate: non-scalar match/term
    /// values and ranges without a finite bound.
    ///
    /// # Errors
    /// [`RagError::InvalidArgument`] naming the offending field.
    pub fn validate(&self) -> Result<(), RagError> {
        for p in &self.predicates {
            match &p.op {
                FilterOp::Match(v) | FilterOp::Term(v) => {
                    if !is_scalar(v) {
                        return Err(RagError::InvalidArgument(format!(
                            "filter on '{}' needs a string, bool or number, got {v}",
                            p.field
                        )));
                    }
                }
                FilterOp::Range { gte, lte } => {
                    let bounds = [gte, lte];
                    if bounds.iter().all(|b| b.is_none())
                        || bounds.iter().any(|b| b.is_some_and(|x| !x.is_finite()))
                    {
                        return Err(RagError::InvalidArgument(format!(
                            "range on '{}' needs finite gte and/or lte",
                            p.field
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Evaluates the conjunction against entry metadata.
    ///
    /// A missing field never satisfies a predicate.
    pub fn eval(&self, metadata: &Metadata) -> bool {
        self.predicates.iter().all(|p| {
            let Some(actual) = metadata.get(&p.field) else {
                return false;
            };
            match &p.op {
                FilterOp::Match(want) | FilterOp::Term(want) => scalar_eq(actual, want),
                FilterOp::Range { gte, lte } => match actual.as_f64() {
                    Some(x) => gte.is_none_or(|g| x >= g) && lte.is_none_or(|l| x <= l),
                    None => false,
                },
            }
        })
    }

    /// Translates to a Qdrant `must` filter, or `None` when empty.
    ///
    /// # Errors
    /// Same as [`validate`](Self::validate).
    pub fn to_qdrant(&self) -> Result<Option<Filter>, RagError> {
        self.validate()?;
        if self.predicates.is_empty() {
            return Ok(None);
        }
        debug!("filters::to_qdrant predicates={}", self.predicates.len());

        let mut must: Vec<Condition> = Vec::with_capacity(self.predicates.len());
        for p in &self.predicates {
            match &p.op {
                FilterOp::Match(v) | FilterOp::Term(v) => match v {
                    Value::String(s) => must.push(Condition::matches(p.field.clone(), s.clone())),
                    Value::Bool(b) => must.push(Condition::matches(p.field.clone(), *b)),
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            must.push(Condition::matches(p.field.clone(), i));
                        } else if let Some(f) = n.as_f64() {
                            must.push(Condition::range(
                                p.field.clone(),
                                Range {
                                    gte: Some(f),
                                    lte: Some(f),
                                    ..Default::default()
                                },
                            ));
                        }
                    }
                    other => {
                        return Err(RagError::InvalidArgument(format!(
                            "filter on '{}' needs a scalar value, got {other}",
                            p.field
                        )));
                    }
                },
                FilterOp::Range { gte, lte } => must.push(Condition::range(
                    p.field.clone(),
                    Range {
                        gte: *gte,
                        lte: *lte,
                        ..Default::default()
                    },
                )),
            }
        }
        Ok(Some(Filter::must(must)))
    }
}

fn is_scalar(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Bool(_) | Value::Number(_))
}

/// Equality where integers and floats compare numerically.
fn scalar_eq(actual: &Value, want: &Value) -> bool {
    match (actual, want) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => actual == want,
    }
}

/* ==========================
Caller filter hints (JSON)
========================== */

#[derive(Deserialize)]
struct Clause {
    field: String,
    operator: String,
    value: Value,
}

#[derive(Deserialize)]
struct RangeValue {
    #[serde(default)]
    gte: Option<f64>,
    #[serde(default)]
    lte: Option<f64>,
}

impl<'de> Deserialize<'de> for SearchFilter {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let clauses = Vec::<Clause>::deserialize(d)?;
        let mut predicates = Vec::with_capacity(clauses.len());
        for c in clauses {
            let op = match c.operator.as_str() {
                "match" | "term" => {
                    if !is_scalar(&c.value) {
                        return Err(D::Error::custom(format!(
                            "{} on '{}' needs a scalar value",
                            c.operator, c.field
                        )));
                    }
                    if c.operator == "match" {
                        FilterOp::Match(c.value)
                    } else {
                        FilterOp::Term(c.value)
                    }
                }
                "range" => {
                    let r: RangeValue = serde_json::from_value(c.value).map_err(D::Error::custom)?;
                    if r.gte.is_none() && r.lte.is_none() {
                        return Err(D::Error::custom(format!(
                            "range on '{}' needs gte and/or lte",
                            c.field
                        )));
                    }
                    FilterOp::Range {
                        gte: r.gte,
                        lte: r.lte,
                    }
                }
                other => {
                    return Err(D::Error::custom(format!("unknown operator '{other}'")));
                }
            };
            predicates.push(FieldPredicate { field: c.field, op });
        }
        Ok(SearchFilter { predicates })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> Metadata {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn predicates_are_anded() {
        let m = meta(json!({"isAdult": false, "voteAverage": 7.5, "chunk": 1}));
        let f = SearchFilter::new()
            .matches("isAdult", false)
            .range("voteAverage", Some(7.0), None);
        assert!(f.eval(&m));
        let f = f.term("chunk", 0);
        assert!(!f.eval(&m));
    }

    #[test]
    fn missing_field_never_matches() {
        let m = meta(json!({"title": "Alien"}));
        assert!(!SearchFilter::new().matches("isAdult", false).eval(&m));
        assert!(SearchFilter::new().eval(&m));
    }

    #[test]
    fn integer_and_float_compare_numerically() {
        let m = meta(json!({"chunk": 2}));
        assert!(SearchFilter::new().term("chunk", 2.0).eval(&m));
        assert!(SearchFilter::new().range("chunk", Some(2.0), None).eval(&m));
        assert!(!SearchFilter::new().range("chunk", Some(3.0), None).eval(&m));
    }

    #[test]
    fn parses_hint_clauses() {
        let f = SearchFilter::from_json(
            r#"[{"operator":"match","field":"isAdult","value":false},
                {"operator":"range","field":"voteAverage","value":{"gte":6.5}}]"#,
        )
        .unwrap();
        assert_eq!(
            f,
            SearchFilter::new()
                .matches("isAdult", false)
                .range("voteAverage", Some(6.5), None)
        );
    }

    #[test]
    fn rejects_bad_hints() {
        assert!(SearchFilter::from_json(r#"[{"operator":"like","field":"title","value":"x"}]"#).is_err());
        assert!(SearchFilter::from_json(r#"[{"operator":"range","field":"popularity","value":{}}]"#).is_err());
        assert!(SearchFilter::from_json(r#"[{"operator":"match","field":"title","value":[1]}]"#).is_err());
    }

    #[test]
    fn qdrant_filter_has_one_must_per_predicate() {
        let f = SearchFilter::new()
            .matches("isAdult", false)
            .term("documentId", "42")
            .range("chunk", Some(3.0), None);
        let q = f.to_qdrant().unwrap().unwrap();
        assert_eq!(q.must.len(), 3);
        assert!(SearchFilter::new().to_qdrant().unwrap().is_none());
    }

    #[test]
    fn non_scalar_values_are_rejected_for_every_backend() {
        let f = SearchFilter::new()
            .matches("isAdult", false)
            .matches("genres", json!(["crime", "drama"]));
        assert!(matches!(f.validate(), Err(RagError::InvalidArgument(_))));
        assert!(matches!(f.to_qdrant(), Err(RagError::InvalidArgument(_))));

        let t = SearchFilter::new().term("documentId", json!({"id": 1}));
        assert!(t.to_qdrant().is_err());

        let open = SearchFilter::new().range("voteAverage", None, None);
        assert!(open.validate().is_err());
        let nan = SearchFilter::new().range("voteAverage", Some(f64::NAN), None);
        assert!(nan.validate().is_err());
    }
}
