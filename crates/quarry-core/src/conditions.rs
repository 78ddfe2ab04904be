//! Comparison conditions extracted from a WHERE clause
//!
//! Only conjunctions of simple `column <op> constant` comparisons are
//! understood. Anything else (OR, NOT, IS NULL, expressions on either side)
//! is rejected with [`FederationError::UnsupportedQuery`] instead of being
//! dropped.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ast::{BinaryOperator, Expr};
use crate::error::{FederationError, FederationResult};
use crate::types::{Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    GtEq,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "like")]
    Like,
}

impl ComparisonOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
            ComparisonOp::In => "in",
            ComparisonOp::Like => "like",
        }
    }

    fn from_binary(op: BinaryOperator) -> Option<Self> {
        match op {
            BinaryOperator::Eq => Some(ComparisonOp::Eq),
            BinaryOperator::NotEq => Some(ComparisonOp::NotEq),
            BinaryOperator::Lt => Some(ComparisonOp::Lt),
            BinaryOperator::LtEq => Some(ComparisonOp::LtEq),
            BinaryOperator::Gt => Some(ComparisonOp::Gt),
            BinaryOperator::GtEq => Some(ComparisonOp::GtEq),
            BinaryOperator::In => Some(ComparisonOp::In),
            BinaryOperator::Like => Some(ComparisonOp::Like),
            _ => None,
        }
    }

    /// Operator with its operands swapped (`5 < a` is `a > 5`).
    fn flipped(self) -> Option<Self> {
        match self {
            ComparisonOp::Eq | ComparisonOp::NotEq => Some(self),
            ComparisonOp::Lt => Some(ComparisonOp::Gt),
            ComparisonOp::LtEq => Some(ComparisonOp::GtEq),
            ComparisonOp::Gt => Some(ComparisonOp::Lt),
            ComparisonOp::GtEq => Some(ComparisonOp::LtEq),
            ComparisonOp::In | ComparisonOp::Like => None,
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(operator, column, value)` triple. For `IN` the value is an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub op: ComparisonOp,
    pub column: String,
    pub value: Value,
}

impl Condition {
    pub fn new(op: ComparisonOp, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op,
            column: column.into(),
            value: value.into(),
        }
    }

    /// Prepares the condition for repeated evaluation.
    pub fn compile(&self) -> FederationResult<CompiledCondition> {
        let like = match (&self.op, &self.value) {
            (ComparisonOp::Like, Value::Text(pattern)) => Some(like_to_regex(pattern)?),
            (ComparisonOp::Like, other) => {
                return Err(FederationError::validation(format!(
                    "LIKE pattern for '{}' must be text, got {}",
                    self.column,
                    other.type_name()
                )))
            }
            _ => None,
        };
        Ok(CompiledCondition {
            condition: self.clone(),
            like,
        })
    }

    /// Evaluates the condition against one record.
    pub fn matches(&self, record: &Record) -> FederationResult<bool> {
        Ok(self.compile()?.matches(record))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.column, self.op, self.value)
    }
}

#[derive(Debug, Clone)]
pub struct CompiledCondition {
    condition: Condition,
    like: Option<Regex>,
}

impl CompiledCondition {
    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn matches(&self, record: &Record) -> bool {
        let Some(actual) = record.get(&self.condition.column) else {
            return false;
        };
        self.matches_value(actual)
    }

    pub fn matches_value(&self, actual: &Value) -> bool {
        let expected = &self.condition.value;
        match self.condition.op {
            ComparisonOp::Eq => actual.compare(expected) == Some(Ordering::Equal),
            ComparisonOp::NotEq => matches!(
                actual.compare(expected),
                Some(Ordering::Less | Ordering::Greater)
            ),
            ComparisonOp::Lt => actual.compare(expected) == Some(Ordering::Less),
            ComparisonOp::LtEq => matches!(
                actual.compare(expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ComparisonOp::Gt => actual.compare(expected) == Some(Ordering::Greater),
            ComparisonOp::GtEq => matches!(
                actual.compare(expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ComparisonOp::In => match expected {
                Value::Array(items) => items
                    .iter()
                    .any(|item| actual.compare(item) == Some(Ordering::Equal)),
                _ => false,
            },
            ComparisonOp::Like => {
                let Some(regex) = &self.like else {
                    return false;
                };
                match actual {
                    Value::Text(s) => regex.is_match(s),
                    Value::Int(i) => regex.is_match(&i.to_string()),
                    Value::Float(f) => regex.is_match(&f.to_string()),
                    _ => false,
                }
            }
        }
    }
}

fn like_to_regex(pattern: &str) -> FederationResult<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?s)^");
    let mut buf = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    Regex::new(&out)
        .map_err(|e| FederationError::validation(format!("Invalid LIKE pattern '{pattern}': {e}")))
}

/// Flattens a WHERE clause into AND-ed comparison conditions, in source order.
pub fn extract_comparison_conditions(
    where_clause: Option<&Expr>,
) -> FederationResult<Vec<Condition>> {
    let mut conditions = Vec::new();
    if let Some(expr) = where_clause {
        collect(expr, &mut conditions)?;
    }
    Ok(conditions)
}

fn collect(expr: &Expr, out: &mut Vec<Condition>) -> FederationResult<()> {
    match expr {
        Expr::BinaryOperation {
            op: BinaryOperator::And,
            left,
            right,
        } => {
            collect(left, out)?;
            collect(right, out)
        }
        Expr::BinaryOperation { op, left, right } => {
            let cmp = ComparisonOp::from_binary(*op)
                .ok_or_else(|| FederationError::unsupported(expr.describe()))?;
            out.push(comparison(cmp, left, right, expr)?);
            Ok(())
        }
        other => Err(FederationError::unsupported(other.describe())),
    }
}

fn comparison(op: ComparisonOp, left: &Expr, right: &Expr, whole: &Expr) -> FederationResult<Condition> {
    match (left, right) {
        (Expr::Identifier(ident), value) => Ok(Condition {
            op,
            column: ident.name().to_string(),
            value: operand_value(op, value)?,
        }),
        (Expr::Constant(value), Expr::Identifier(ident)) => {
            let flipped = op
                .flipped()
                .ok_or_else(|| FederationError::unsupported(whole.describe()))?;
            Ok(Condition {
                op: flipped,
                column: ident.name().to_string(),
                value: value.clone(),
            })
        }
        (Expr::Constant(_), other) => Err(FederationError::unsupported(other.describe())),
        (other, _) => Err(FederationError::unsupported(other.describe())),
    }
}

fn operand_value(op: ComparisonOp, expr: &Expr) -> FederationResult<Value> {
    match (op, expr) {
        (ComparisonOp::In, Expr::Tuple(items)) => items
            .iter()
            .map(|item| match item {
                Expr::Constant(value) => Ok(value.clone()),
                other => Err(FederationError::unsupported(other.describe())),
            })
            .collect::<FederationResult<Vec<_>>>()
            .map(Value::Array),
        (ComparisonOp::In, Expr::Constant(value)) => Ok(Value::Array(vec![value.clone()])),
        (_, Expr::Constant(value)) => Ok(value.clone()),
        (_, other) => Err(FederationError::unsupported(other.describe())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{col, lit, UnaryOperator};

    #[test]
    fn extracts_and_tree_in_order() {
        let expr = col("price")
            .gt(lit(100))
            .and(col("vendor").eq(lit("acme")))
            .and(col("id").in_list(vec![lit(1), lit(2)]));

        let conditions = extract_comparison_conditions(Some(&expr)).unwrap();
        assert_eq!(
            conditions,
            vec![
                Condition::new(ComparisonOp::Gt, "price", 100),
                Condition::new(ComparisonOp::Eq, "vendor", "acme"),
                Condition::new(
                    ComparisonOp::In,
                    "id",
                    Value::Array(vec![Value::Int(1), Value::Int(2)])
                ),
            ]
        );
    }

    #[test]
    fn reversed_comparison_is_flipped() {
        let expr = lit(100).lt(col("price"));
        let conditions = extract_comparison_conditions(Some(&expr)).unwrap();
        assert_eq!(conditions, vec![Condition::new(ComparisonOp::Gt, "price", 100)]);
    }

    #[test]
    fn qualified_column_uses_last_part() {
        let expr = col("products.price").lt_eq(lit(5));
        let conditions = extract_comparison_conditions(Some(&expr)).unwrap();
        assert_eq!(conditions[0].column, "price");
    }

    #[test]
    fn or_is_unsupported() {
        let expr = col("a").eq(lit(1)).or(col("b").eq(lit(2)));
        let err = extract_comparison_conditions(Some(&expr)).unwrap_err();
        assert_eq!(err, FederationError::unsupported("operator OR"));
    }

    #[test]
    fn not_and_is_null_are_unsupported() {
        let not = Expr::UnaryOperation {
            op: UnaryOperator::Not,
            operand: Box::new(col("a").eq(lit(1))),
        };
        assert!(matches!(
            extract_comparison_conditions(Some(&not)),
            Err(FederationError::UnsupportedQuery { .. })
        ));

        let is_null = Expr::IsNull {
            expr: Box::new(col("a")),
            negated: false,
        };
        assert!(matches!(
            extract_comparison_conditions(Some(&is_null)),
            Err(FederationError::UnsupportedQuery { .. })
        ));
    }

    #[test]
    fn column_to_column_comparison_is_unsupported() {
        let expr = col("a").eq(col("b"));
        assert!(matches!(
            extract_comparison_conditions(Some(&expr)),
            Err(FederationError::UnsupportedQuery { .. })
        ));
    }

    #[test]
    fn missing_where_yields_no_conditions() {
        assert!(extract_comparison_conditions(None).unwrap().is_empty());
    }

    #[test]
    fn like_is_anchored_and_case_sensitive() {
        let cond = Condition::new(ComparisonOp::Like, "title", "Desk%").compile().unwrap();
        assert!(cond.matches(&Record::new().with("title", "Desk lamp")));
        assert!(!cond.matches(&Record::new().with("title", "desk lamp")));
        assert!(!cond.matches(&Record::new().with("title", "Big Desk")));

        let single = Condition::new(ComparisonOp::Like, "code", "a_c").compile().unwrap();
        assert!(single.matches(&Record::new().with("code", "abc")));
        assert!(!single.matches(&Record::new().with("code", "abbc")));

        let dotted = Condition::new(ComparisonOp::Like, "code", "a.c").compile().unwrap();
        assert!(!dotted.matches(&Record::new().with("code", "abc")));
    }

    #[test]
    fn null_and_missing_never_match() {
        let cond = Condition::new(ComparisonOp::NotEq, "vendor", "acme").compile().unwrap();
        assert!(!cond.matches(&Record::new().with("vendor", Value::Null)));
        assert!(!cond.matches(&Record::new()));
        assert!(cond.matches(&Record::new().with("vendor", "other")));
    }

    #[test]
    fn in_matches_any_member() {
        let cond = Condition::new(
            ComparisonOp::In,
            "id",
            Value::Array(vec![Value::Int(1), Value::Int(3)]),
        );
        assert!(cond.matches(&Record::new().with("id", 3)).unwrap());
        assert!(!cond.matches(&Record::new().with("id", 2)).unwrap());
    }
}
