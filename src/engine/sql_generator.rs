//! SQL Generator
//!
//! Renders a [`SelectQuery`] into dialect-specific SQL text. Rendering is a
//! pure function of the AST: nested operations are always parenthesized, so
//! the same tree yields the same text regardless of operator precedence
//! rules in the target database. Constructs with no rendering fail with
//! `UnsupportedQuery` instead of being skipped.

use quarry_core::ast::{BinaryOperator, Expr, Identifier, SelectQuery, SortDirection, UnaryOperator};
use quarry_core::{FederationError, FederationResult, Value};

/// Functions that render identically in every supported dialect.
const PORTABLE_FUNCTIONS: &[&str] = &[
    "ABS", "AVG", "COALESCE", "COUNT", "LENGTH", "LOWER", "MAX", "MIN", "ROUND", "SUM", "UPPER",
];

/// SQL dialect for the relational handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
    Sqlite,
}

impl SqlDialect {
    pub fn from_handler_type(handler_type: &str) -> Option<Self> {
        match handler_type.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(SqlDialect::Postgres),
            "mysql" | "mariadb" => Some(SqlDialect::MySql),
            "sqlite" => Some(SqlDialect::Sqlite),
            _ => None,
        }
    }

    /// Quote an identifier according to the dialect
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            SqlDialect::Postgres | SqlDialect::Sqlite => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
            SqlDialect::MySql => {
                format!("`{}`", name.replace('`', "``"))
            }
        }
    }

    /// Quote each part of a qualified name (`schema.table`, `table.column`)
    pub fn quote_qualified(&self, ident: &Identifier) -> String {
        ident
            .parts
            .iter()
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Format a value as a SQL literal
    pub fn format_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => match self {
                SqlDialect::Postgres => if *b { "TRUE" } else { "FALSE" }.to_string(),
                SqlDialect::MySql | SqlDialect::Sqlite => if *b { "1" } else { "0" }.to_string(),
            },
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.is_nan() {
                    "'NaN'".to_string()
                } else if f.is_infinite() {
                    if *f > 0.0 { "'Infinity'" } else { "'-Infinity'" }.to_string()
                } else {
                    format!("{:?}", f)
                }
            }
            Value::Text(s) => self.escape_string(s),
            Value::Bytes(b) => self.format_bytes(b),
            Value::Json(j) => self.escape_string(&j.to_string()),
            Value::Array(arr) => match self {
                SqlDialect::Postgres => {
                    let elements: Vec<String> = arr.iter().map(|v| self.format_value(v)).collect();
                    format!("ARRAY[{}]", elements.join(", "))
                }
                SqlDialect::MySql | SqlDialect::Sqlite => {
                    let json = serde_json::to_string(arr).unwrap_or_else(|_| "[]".to_string());
                    self.escape_string(&json)
                }
            },
        }
    }

    /// Escape a string for SQL
    fn escape_string(&self, s: &str) -> String {
        match self {
            SqlDialect::Postgres => {
                let mut escaped = String::with_capacity(s.len());
                let mut needs_e_prefix = false;

                for ch in s.chars() {
                    match ch {
                        '\\' => {
                            needs_e_prefix = true;
                            escaped.push_str("\\\\");
                        }
                        '\'' => escaped.push_str("''"),
                        '\n' => {
                            needs_e_prefix = true;
                            escaped.push_str("\\n");
                        }
                        '\r' => {
                            needs_e_prefix = true;
                            escaped.push_str("\\r");
                        }
                        '\t' => {
                            needs_e_prefix = true;
                            escaped.push_str("\\t");
                        }
                        _ => escaped.push(ch),
                    }
                }

                if needs_e_prefix {
                    format!("E'{}'", escaped)
                } else {
                    format!("'{}'", escaped)
                }
            }
            SqlDialect::MySql => {
                let escaped = s
                    .replace('\\', "\\\\")
                    .replace('\'', "''")
                    .replace('\n', "\\n")
                    .replace('\r', "\\r")
                    .replace('\t', "\\t")
                    .replace('\0', "\\0");
                format!("'{}'", escaped)
            }
            SqlDialect::Sqlite => {
                format!("'{}'", s.replace('\'', "''"))
            }
        }
    }

    /// Format bytes as a SQL literal
    fn format_bytes(&self, bytes: &[u8]) -> String {
        let hex_string: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        match self {
            SqlDialect::Postgres => format!("'\\x{}'", hex_string),
            SqlDialect::MySql | SqlDialect::Sqlite => format!("X'{}'", hex_string),
        }
    }

    fn render_expr(&self, expr: &Expr) -> FederationResult<String> {
        match expr {
            Expr::Identifier(ident) => Ok(self.quote_qualified(ident)),
            Expr::Constant(value) => Ok(self.format_value(value)),
            Expr::Star => Ok("*".to_string()),
            Expr::Tuple(_) => Err(FederationError::unsupported("tuple outside IN")),
            Expr::BinaryOperation { op, left, right } => match op {
                BinaryOperator::In | BinaryOperator::NotIn => {
                    let items = match right.as_ref() {
                        Expr::Tuple(items) if items.is_empty() => {
                            return Err(FederationError::unsupported("empty IN list"))
                        }
                        Expr::Tuple(items) => items,
                        other => return Err(FederationError::unsupported(other.describe())),
                    };
                    let rendered = items
                        .iter()
                        .map(|item| self.render_operand(item))
                        .collect::<FederationResult<Vec<_>>>()?;
                    Ok(format!(
                        "{} {} ({})",
                        self.render_operand(left)?,
                        op.as_sql(),
                        rendered.join(", ")
                    ))
                }
                _ => Ok(format!(
                    "{} {} {}",
                    self.render_operand(left)?,
                    op.as_sql(),
                    self.render_operand(right)?
                )),
            },
            Expr::UnaryOperation { op, operand } => match op {
                UnaryOperator::Not => Ok(format!("NOT ({})", self.render_expr(operand)?)),
                // `--` would start a line comment
                UnaryOperator::Minus => Ok(format!("-({})", self.render_expr(operand)?)),
            },
            Expr::IsNull { expr, negated } => Ok(format!(
                "{} IS {}NULL",
                self.render_operand(expr)?,
                if *negated { "NOT " } else { "" }
            )),
            Expr::Function { name, args } => {
                let upper = name.to_ascii_uppercase();
                if !PORTABLE_FUNCTIONS.contains(&upper.as_str()) {
                    return Err(FederationError::unsupported(expr.describe()));
                }
                let rendered = args
                    .iter()
                    .map(|arg| match arg {
                        Expr::Star if upper == "COUNT" => Ok("*".to_string()),
                        Expr::Star => Err(FederationError::unsupported(format!("{upper}(*)"))),
                        other => self.render_expr(other),
                    })
                    .collect::<FederationResult<Vec<_>>>()?;
                Ok(format!("{}({})", upper, rendered.join(", ")))
            }
            Expr::Parameter(_) => Err(FederationError::unsupported(expr.describe())),
        }
    }

    /// Renders an operand, parenthesizing nested operations.
    fn render_operand(&self, expr: &Expr) -> FederationResult<String> {
        match expr {
            Expr::BinaryOperation { .. } | Expr::IsNull { .. } => {
                Ok(format!("({})", self.render_expr(expr)?))
            }
            Expr::Star => Err(FederationError::unsupported("* as an operand")),
            other => self.render_expr(other),
        }
    }
}

/// Render a SELECT statement for the given dialect
pub fn render_select(dialect: SqlDialect, query: &SelectQuery) -> FederationResult<String> {
    if query.targets.is_empty() {
        return Err(FederationError::validation("SELECT without targets"));
    }

    let targets = query
        .targets
        .iter()
        .map(|target| {
            let rendered = match &target.expr {
                Expr::Star => "*".to_string(),
                other => dialect.render_expr(other)?,
            };
            Ok(match &target.alias {
                Some(alias) => format!("{} AS {}", rendered, dialect.quote_ident(alias)),
                None => rendered,
            })
        })
        .collect::<FederationResult<Vec<_>>>()?;

    let mut sql = format!("SELECT {}", targets.join(", "));

    if let Some(from) = &query.from {
        sql.push_str(" FROM ");
        sql.push_str(&dialect.quote_qualified(from));
    }

    if let Some(predicate) = &query.where_clause {
        sql.push_str(" WHERE ");
        sql.push_str(&dialect.render_expr(predicate)?);
    }

    if !query.order_by.is_empty() {
        let keys = query
            .order_by
            .iter()
            .map(|key| {
                let direction = match key.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                Ok(format!("{} {}", dialect.render_operand(&key.field)?, direction))
            })
            .collect::<FederationResult<Vec<_>>>()?;
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }

    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    Ok(sql)
}
