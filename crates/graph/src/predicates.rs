//! Predicate types and evaluation logic for condition-node branches.
//!
//! Predicates run against the execution context captured at entry: a JSON
//! object with a `subscriber` record (attributes plus a `tags` array) and
//! the triggering `event` payload.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateGroup {
    pub operator: LogicalOperator,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub groups: Vec<PredicateGroup>,
}

impl PredicateGroup {
    /// Group matching when all members match. An empty `And` group matches
    /// everything (no constraints).
    pub fn all(predicates: Vec<Predicate>) -> Self {
        Self {
            operator: LogicalOperator::And,
            predicates,
            groups: Vec::new(),
        }
    }

    /// Group matching when any member matches.
    pub fn any(predicates: Vec<Predicate>) -> Self {
        Self {
            operator: LogicalOperator::Or,
            predicates,
            groups: Vec::new(),
        }
    }

    /// Evaluates the group against a context object.
    pub fn evaluate(&self, context: &serde_json::Value) -> bool {
        if self.predicates.is_empty() && self.groups.is_empty() {
            // An unconstrained And group matches everything; Or matches nothing.
            return matches!(self.operator, LogicalOperator::And);
        }

        let mut members = self
            .predicates
            .iter()
            .map(|p| p.evaluate(context))
            .chain(self.groups.iter().map(|g| g.evaluate(context)));

        match self.operator {
            LogicalOperator::And => members.all(|m| m),
            LogicalOperator::Or => members.any(|m| m),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Compare a subscriber attribute (`subscriber.<key>`).
    Attribute {
        key: String,
        operator: ComparisonOperator,
        value: serde_json::Value,
    },
    /// Compare a field of the triggering event payload (`event.<key>`).
    EventField {
        key: String,
        operator: ComparisonOperator,
        value: serde_json::Value,
    },
    /// Subscriber tag membership (`subscriber.tags` contains `tag`).
    HasTag { tag: String },
}

impl Predicate {
    pub fn evaluate(&self, context: &serde_json::Value) -> bool {
        match self {
            Predicate::Attribute {
                key,
                operator,
                value,
            } => {
                let actual = lookup(context, "subscriber", key);
                compare_values(&actual, operator, value)
            }
            Predicate::EventField {
                key,
                operator,
                value,
            } => {
                let actual = lookup(context, "event", key);
                compare_values(&actual, operator, value)
            }
            Predicate::HasTag { tag } => context
                .pointer("/subscriber/tags")
                .and_then(|v| v.as_array())
                .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some(tag))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsSet,
    IsNotSet,
    InList,
    NotInList,
}

/// Resolves `root.key` inside the context, supporting dotted paths
/// ("address.city"). Missing fields resolve to JSON null.
fn lookup(context: &serde_json::Value, root: &str, key: &str) -> serde_json::Value {
    let mut current = match context.get(root) {
        Some(v) => v,
        None => return serde_json::Value::Null,
    };
    for part in key.split('.') {
        match current.get(part) {
            Some(v) => current = v,
            None => return serde_json::Value::Null,
        }
    }
    current.clone()
}

#[allow(clippy::unnecessary_map_or)]
pub fn compare_values(
    actual: &serde_json::Value,
    operator: &ComparisonOperator,
    expected: &serde_json::Value,
) -> bool {
    match operator {
        ComparisonOperator::Equals => actual == expected,
        ComparisonOperator::NotEquals => actual != expected,
        ComparisonOperator::GreaterThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Greater)
        }
        ComparisonOperator::GreaterThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Less)
        }
        ComparisonOperator::LessThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Less)
        }
        ComparisonOperator::LessThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Greater)
        }
        ComparisonOperator::Contains => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.contains(e)),
        ComparisonOperator::NotContains => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(true, |(a, e)| !a.contains(e)),
        ComparisonOperator::StartsWith => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.starts_with(e)),
        ComparisonOperator::EndsWith => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.ends_with(e)),
        ComparisonOperator::IsSet => !actual.is_null(),
        ComparisonOperator::IsNotSet => actual.is_null(),
        ComparisonOperator::InList => expected
            .as_array()
            .map_or(false, |list| list.contains(actual)),
        ComparisonOperator::NotInList => expected
            .as_array()
            .map_or(true, |list| !list.contains(actual)),
    }
}

fn numeric_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    let a_num = a.as_f64()?;
    let b_num = b.as_f64()?;
    a_num.partial_cmp(&b_num)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_context() -> serde_json::Value {
        json!({
            "subscriber": {
                "email": "ada@example.com",
                "total_spent": 412.50,
                "tags": ["vip", "newsletter"],
                "address": { "country": "NZ" }
            },
            "event": {
                "type": "order/created",
                "order_total": 89.0
            }
        })
    }

    #[test]
    fn test_attribute_comparisons() {
        let ctx = sample_context();

        let gt = Predicate::Attribute {
            key: "total_spent".into(),
            operator: ComparisonOperator::GreaterThan,
            value: json!(400),
        };
        assert!(gt.evaluate(&ctx));

        let dotted = Predicate::Attribute {
            key: "address.country".into(),
            operator: ComparisonOperator::Equals,
            value: json!("NZ"),
        };
        assert!(dotted.evaluate(&ctx));

        let missing = Predicate::Attribute {
            key: "nickname".into(),
            operator: ComparisonOperator::IsSet,
            value: json!(null),
        };
        assert!(!missing.evaluate(&ctx));
    }

    #[test]
    fn test_has_tag() {
        let ctx = sample_context();
        assert!(Predicate::HasTag { tag: "vip".into() }.evaluate(&ctx));
        assert!(!Predicate::HasTag {
            tag: "lapsed".into()
        }
        .evaluate(&ctx));
    }

    #[test]
    fn test_event_field() {
        let ctx = sample_context();
        let pred = Predicate::EventField {
            key: "order_total".into(),
            operator: ComparisonOperator::LessThan,
            value: json!(100),
        };
        assert!(pred.evaluate(&ctx));
    }

    #[test]
    fn test_group_logic() {
        let ctx = sample_context();

        let both = PredicateGroup::all(vec![
            Predicate::HasTag { tag: "vip".into() },
            Predicate::Attribute {
                key: "total_spent".into(),
                operator: ComparisonOperator::GreaterThan,
                value: json!(100),
            },
        ]);
        assert!(both.evaluate(&ctx));

        let either = PredicateGroup::any(vec![
            Predicate::HasTag {
                tag: "lapsed".into(),
            },
            Predicate::HasTag { tag: "vip".into() },
        ]);
        assert!(either.evaluate(&ctx));

        // Empty And group matches everything; empty Or group matches nothing.
        assert!(PredicateGroup::all(vec![]).evaluate(&ctx));
        assert!(!PredicateGroup::any(vec![]).evaluate(&ctx));
    }

    #[test]
    fn test_nested_groups() {
        let ctx = sample_context();
        let group = PredicateGroup {
            operator: LogicalOperator::And,
            predicates: vec![Predicate::HasTag { tag: "vip".into() }],
            groups: vec![PredicateGroup::any(vec![
                Predicate::EventField {
                    key: "order_total".into(),
                    operator: ComparisonOperator::GreaterThan,
                    value: json!(1000),
                },
                Predicate::Attribute {
                    key: "address.country".into(),
                    operator: ComparisonOperator::InList,
                    value: json!(["NZ", "AU"]),
                },
            ])],
        };
        assert!(group.evaluate(&ctx));
    }
}
