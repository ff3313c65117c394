//! Compiled, versioned condition language used by triggers, goals, branch
//! nodes, and wait conditions.
//!
//! Evaluation never fails: missing data resolves to the operator's default
//! ("event has not occurred" is `false`, an unset property is `null`), and an
//! envelope with an unsupported version evaluates to `false`.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::clock::{self, MAX_SPAN_SECS};
use crate::error::{JourneyError, JourneyResult};

/// Highest envelope version this evaluator understands.
pub const SUPPORTED_VERSION: u32 = 1;

/// A compiled expression together with the language version it targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub expr: Expr,
}

impl Envelope {
    pub fn new(expr: Expr) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            expr,
        }
    }

    /// Parses an envelope from its JSON form.
    pub fn from_json(value: &Value) -> JourneyResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| JourneyError::Configuration(format!("malformed expression: {e}")))
    }

    /// Rejects envelopes this evaluator cannot run.
    pub fn validate(&self) -> JourneyResult<()> {
        if self.version == 0 || self.version > SUPPORTED_VERSION {
            return Err(JourneyError::Configuration(format!(
                "unsupported expression version {}",
                self.version
            )));
        }
        if self.expr.contains_unsupported() {
            return Err(JourneyError::Configuration(
                "expression contains an unsupported operator".to_string(),
            ));
        }
        if let Some(secs) = self.expr.longest_window().filter(|s| *s > MAX_SPAN_SECS) {
            return Err(JourneyError::Configuration(format!(
                "expression window of {secs}s exceeds {MAX_SPAN_SECS}s"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Expr {
    Literal {
        value: Value,
    },
    UserProperty {
        key: String,
    },
    /// Number of occurrences of `name` in the trailing window (all time when
    /// `within_secs` is absent).
    EventCount {
        name: String,
        #[serde(default)]
        within_secs: Option<u64>,
    },
    /// Epoch seconds of the last occurrence of `name`, or `null`.
    EventLastTime {
        name: String,
        #[serde(default)]
        within_secs: Option<u64>,
    },
    EventOccurred {
        name: String,
        #[serde(default)]
        within_secs: Option<u64>,
    },
    InSegment {
        segment_id: String,
    },
    Feature {
        feature_id: String,
        #[serde(default)]
        entity_id: Option<String>,
        field: FeatureField,
    },
    /// Current time in epoch seconds.
    Now,
    Compare {
        operator: ComparisonOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        args: Vec<Expr>,
    },
    Or {
        args: Vec<Expr>,
    },
    Not {
        arg: Box<Expr>,
    },
    #[serde(other)]
    Unsupported,
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn compare(operator: ComparisonOperator, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            operator,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn contains_unsupported(&self) -> bool {
        match self {
            Expr::Unsupported => true,
            Expr::Compare { left, right, .. } => {
                left.contains_unsupported() || right.contains_unsupported()
            }
            Expr::And { args } | Expr::Or { args } => args.iter().any(Expr::contains_unsupported),
            Expr::Not { arg } => arg.contains_unsupported(),
            _ => false,
        }
    }

    fn longest_window(&self) -> Option<u64> {
        match self {
            Expr::EventCount { within_secs, .. }
            | Expr::EventLastTime { within_secs, .. }
            | Expr::EventOccurred { within_secs, .. } => *within_secs,
            Expr::Compare { left, right, .. } => left.longest_window().max(right.longest_window()),
            Expr::And { args } | Expr::Or { args } => {
                args.iter().filter_map(Expr::longest_window).max()
            }
            Expr::Not { arg } => arg.longest_window(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureField {
    Allowed,
    Unlimited,
    Balance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    IsSet,
    IsNotSet,
    InList,
    NotInList,
}

/// Entitlement snapshot for a feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureAccess {
    pub allowed: bool,
    pub unlimited: bool,
    pub balance: i64,
}

/// Data sources an expression reads from. Implementations absorb their own
/// failures and report "no data" instead.
#[async_trait]
pub trait DataAdapters: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn user_property(&self, key: &str) -> Option<Value>;

    async fn event_last_time(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>>;

    async fn event_count(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> u64;

    async fn in_segment(&self, segment_id: &str) -> bool;

    async fn feature_access(&self, feature_id: &str, entity_id: Option<&str>) -> FeatureAccess;
}

type EvalFuture<'a> = Pin<Box<dyn Future<Output = Value> + Send + 'a>>;

/// Stateless interpreter over [`Expr`] trees.
#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates the envelope to a value. Unsupported versions yield `false`.
    pub async fn evaluate(&self, envelope: &Envelope, adapters: &dyn DataAdapters) -> Value {
        if let Err(e) = envelope.validate() {
            warn!(version = envelope.version, error = %e, "Refusing to evaluate expression");
            metrics::counter!("expression.eval_errors").increment(1);
            return Value::Bool(false);
        }
        self.eval(&envelope.expr, adapters).await
    }

    pub async fn evaluate_bool(&self, envelope: &Envelope, adapters: &dyn DataAdapters) -> bool {
        truthy(&self.evaluate(envelope, adapters).await)
    }

    fn eval<'a>(&'a self, expr: &'a Expr, adapters: &'a dyn DataAdapters) -> EvalFuture<'a> {
        Box::pin(async move {
            match expr {
                Expr::Literal { value } => value.clone(),
                Expr::UserProperty { key } => {
                    adapters.user_property(key).await.unwrap_or(Value::Null)
                }
                Expr::EventCount { name, within_secs } => {
                    let since = window_start(adapters.now(), *within_secs);
                    Value::from(adapters.event_count(name, since, None).await)
                }
                Expr::EventLastTime { name, within_secs } => {
                    let since = window_start(adapters.now(), *within_secs);
                    adapters
                        .event_last_time(name, since, None)
                        .await
                        .map(|t| Value::from(t.timestamp()))
                        .unwrap_or(Value::Null)
                }
                Expr::EventOccurred { name, within_secs } => {
                    let since = window_start(adapters.now(), *within_secs);
                    Value::Bool(adapters.event_last_time(name, since, None).await.is_some())
                }
                Expr::InSegment { segment_id } => {
                    Value::Bool(adapters.in_segment(segment_id).await)
                }
                Expr::Feature {
                    feature_id,
                    entity_id,
                    field,
                } => {
                    let access = adapters
                        .feature_access(feature_id, entity_id.as_deref())
                        .await;
                    match field {
                        FeatureField::Allowed => Value::Bool(access.allowed),
                        FeatureField::Unlimited => Value::Bool(access.unlimited),
                        FeatureField::Balance => Value::from(access.balance),
                    }
                }
                Expr::Now => Value::from(adapters.now().timestamp()),
                Expr::Compare {
                    operator,
                    left,
                    right,
                } => {
                    let l = self.eval(left, adapters).await;
                    let r = self.eval(right, adapters).await;
                    Value::Bool(compare_values(&l, operator, &r))
                }
                Expr::And { args } => {
                    for arg in args {
                        if !truthy(&self.eval(arg, adapters).await) {
                            return Value::Bool(false);
                        }
                    }
                    Value::Bool(true)
                }
                Expr::Or { args } => {
                    for arg in args {
                        if truthy(&self.eval(arg, adapters).await) {
                            return Value::Bool(true);
                        }
                    }
                    Value::Bool(false)
                }
                Expr::Not { arg } => Value::Bool(!truthy(&self.eval(arg, adapters).await)),
                Expr::Unsupported => {
                    warn!("Unsupported expression operator evaluated as null");
                    metrics::counter!("expression.eval_errors").increment(1);
                    Value::Null
                }
            }
        })
    }
}

// A window reaching past the representable range covers all history.
fn window_start(now: DateTime<Utc>, within_secs: Option<u64>) -> Option<DateTime<Utc>> {
    within_secs.and_then(|secs| clock::before(now, secs))
}

/// Boolean interpretation of an evaluated value.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn compare_values(actual: &Value, operator: &ComparisonOperator, expected: &Value) -> bool {
    use std::cmp::Ordering;

    match operator {
        ComparisonOperator::Equals => loose_eq(actual, expected),
        ComparisonOperator::NotEquals => !loose_eq(actual, expected),
        ComparisonOperator::GreaterThan => {
            numeric_cmp(actual, expected).is_some_and(|o| o == Ordering::Greater)
        }
        ComparisonOperator::GreaterThanOrEqual => {
            numeric_cmp(actual, expected).is_some_and(|o| o != Ordering::Less)
        }
        ComparisonOperator::LessThan => {
            numeric_cmp(actual, expected).is_some_and(|o| o == Ordering::Less)
        }
        ComparisonOperator::LessThanOrEqual => {
            numeric_cmp(actual, expected).is_some_and(|o| o != Ordering::Greater)
        }
        ComparisonOperator::Contains => match actual {
            Value::String(a) => expected.as_str().is_some_and(|e| a.contains(e)),
            Value::Array(items) => items.contains(expected),
            _ => false,
        },
        ComparisonOperator::StartsWith => actual
            .as_str()
            .zip(expected.as_str())
            .is_some_and(|(a, e)| a.starts_with(e)),
        ComparisonOperator::EndsWith => actual
            .as_str()
            .zip(expected.as_str())
            .is_some_and(|(a, e)| a.ends_with(e)),
        ComparisonOperator::IsSet => !actual.is_null(),
        ComparisonOperator::IsNotSet => actual.is_null(),
        ComparisonOperator::InList => expected
            .as_array()
            .is_some_and(|list| list.iter().any(|v| loose_eq(actual, v))),
        ComparisonOperator::NotInList => expected
            .as_array()
            .map_or(true, |list| !list.iter().any(|v| loose_eq(actual, v))),
    }
}

// 1 and 1.0 compare equal.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match numeric_cmp(a, b) {
        Some(o) => o == std::cmp::Ordering::Equal,
        None => a == b,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let a_num = a.as_f64()?;
    let b_num = b.as_f64()?;
    a_num.partial_cmp(&b_num)
}
