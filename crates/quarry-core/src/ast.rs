//! Structured query AST
//!
//! The federation layer never parses SQL text itself: an upstream parser
//! produces a [`SelectQuery`] and handlers treat it as read-only input.
//! The builder helpers exist so that callers and tests can assemble
//! queries without a parser.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// A possibly qualified identifier (`products.price` has parts `["products", "price"]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub parts: Vec<String>,
}

impl Identifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            parts: vec![name.into()],
        }
    }

    pub fn qualified<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    /// The unqualified name (last part).
    pub fn name(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
    Like,
    NotLike,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOperator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            BinaryOperator::Eq => "=",
            BinaryOperator::NotEq => "<>",
            BinaryOperator::Lt => "<",
            BinaryOperator::LtEq => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::GtEq => ">=",
            BinaryOperator::In => "IN",
            BinaryOperator::NotIn => "NOT IN",
            BinaryOperator::Like => "LIKE",
            BinaryOperator::NotLike => "NOT LIKE",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
            BinaryOperator::Plus => "+",
            BinaryOperator::Minus => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOperator {
    Not,
    Minus,
}

/// Expression tree used in targets, WHERE and ORDER BY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Identifier(Identifier),
    Constant(Value),
    /// `*`, either as a target or as the argument of `COUNT(*)`.
    Star,
    /// Parenthesized list, the right-hand side of `IN`.
    Tuple(Vec<Expr>),
    BinaryOperation {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOperation {
        op: UnaryOperator,
        operand: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    /// Unbound placeholder (`?`, `$1`).
    Parameter(String),
}

impl Expr {
    fn binary(op: BinaryOperator, left: Expr, right: Expr) -> Expr {
        Expr::BinaryOperation {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(self, right: Expr) -> Expr {
        Self::binary(BinaryOperator::Eq, self, right)
    }

    pub fn not_eq(self, right: Expr) -> Expr {
        Self::binary(BinaryOperator::NotEq, self, right)
    }

    pub fn lt(self, right: Expr) -> Expr {
        Self::binary(BinaryOperator::Lt, self, right)
    }

    pub fn lt_eq(self, right: Expr) -> Expr {
        Self::binary(BinaryOperator::LtEq, self, right)
    }

    pub fn gt(self, right: Expr) -> Expr {
        Self::binary(BinaryOperator::Gt, self, right)
    }

    pub fn gt_eq(self, right: Expr) -> Expr {
        Self::binary(BinaryOperator::GtEq, self, right)
    }

    pub fn like(self, pattern: Expr) -> Expr {
        Self::binary(BinaryOperator::Like, self, pattern)
    }

    pub fn in_list(self, items: Vec<Expr>) -> Expr {
        Self::binary(BinaryOperator::In, self, Expr::Tuple(items))
    }

    pub fn and(self, right: Expr) -> Expr {
        Self::binary(BinaryOperator::And, self, right)
    }

    pub fn or(self, right: Expr) -> Expr {
        Self::binary(BinaryOperator::Or, self, right)
    }

    /// Human-readable name of the construct, used in unsupported-query errors.
    pub fn describe(&self) -> String {
        match self {
            Expr::Identifier(ident) => format!("identifier {ident}"),
            Expr::Constant(_) => "constant".to_string(),
            Expr::Star => "*".to_string(),
            Expr::Tuple(_) => "tuple".to_string(),
            Expr::BinaryOperation { op, .. } => format!("operator {}", op.as_sql()),
            Expr::UnaryOperation { op, .. } => match op {
                UnaryOperator::Not => "operator NOT".to_string(),
                UnaryOperator::Minus => "unary minus".to_string(),
            },
            Expr::IsNull { negated: false, .. } => "IS NULL".to_string(),
            Expr::IsNull { negated: true, .. } => "IS NOT NULL".to_string(),
            Expr::Function { name, .. } => format!("function {name}"),
            Expr::Parameter(name) => format!("query parameter {name}"),
        }
    }
}

/// Column reference by name.
pub fn col(name: &str) -> Expr {
    let parts: Vec<&str> = name.split('.').collect();
    Expr::Identifier(Identifier::qualified(parts))
}

/// Literal constant.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Constant(value.into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub expr: Expr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: Expr,
    pub direction: SortDirection,
}

/// A parsed SELECT statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectQuery {
    pub targets: Vec<Target>,
    pub from: Option<Identifier>,
    pub where_clause: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
}

impl SelectQuery {
    /// `SELECT * FROM <table>`
    pub fn from_table(table: &str) -> Self {
        Self {
            targets: vec![Target {
                expr: Expr::Star,
                alias: None,
            }],
            from: Some(Identifier::qualified(table.split('.'))),
            ..Self::default()
        }
    }

    /// Replaces the target list with plain column references.
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.targets = columns
            .into_iter()
            .map(|c| Target {
                expr: col(c.as_ref()),
                alias: None,
            })
            .collect();
        self
    }

    pub fn target(mut self, expr: Expr, alias: Option<&str>) -> Self {
        self.targets.push(Target {
            expr,
            alias: alias.map(str::to_string),
        });
        self
    }

    /// Adds a predicate, AND-ed with any existing one.
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn order_by(mut self, column: &str, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            field: col(column),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when any target is `*`.
    pub fn selects_all(&self) -> bool {
        self.targets.iter().any(|t| t.expr == Expr::Star)
    }
}
