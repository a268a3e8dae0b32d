//! SQL expressions.
//!
//! Expressions are kept as a tree so they can be rendered for any [`Dialect`]
//! and evaluated directly by in-process executors.

use crate::clause::{OrderBy, OrderDirection};
use crate::select::Select;
use sqlmodel_derived_core::{Dialect, Value};

/// A SQL expression that can be used in SELECT lists, WHERE, SET, etc.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference with optional table qualifier
    Column {
        /// Optional table name or alias
        table: Option<String>,
        /// Column name
        name: String,
    },

    /// Literal value, bound as a parameter
    Literal(Value),

    /// Binary operation (e.g., a = b, a > b)
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// Unary operation (e.g., NOT a, -a)
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// Function call (e.g., SUM(price), LOWER(name))
    Function { name: String, args: Vec<Expr> },

    /// Special aggregate: COUNT(*)
    CountStar,

    /// IN expression
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// IS DISTINCT FROM / IS NOT DISTINCT FROM (NULL-safe comparison)
    IsDistinctFrom {
        left: Box<Expr>,
        right: Box<Expr>,
        negated: bool,
    },

    /// Scalar subquery
    Subquery(Box<Select>),

    /// EXISTS (subquery) / NOT EXISTS (subquery)
    Exists { subquery: Box<Select>, negated: bool },

    /// Parenthesized expression
    Paren(Box<Expr>),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Comparison
    /// Equal (=)
    Eq,
    /// Not equal (<>)
    Ne,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,

    // Logical
    /// Logical AND
    And,
    /// Logical OR
    Or,

    // Arithmetic
    /// Addition (+)
    Add,
    /// Subtraction (-)
    Sub,
    /// Multiplication (*)
    Mul,
    /// Division (/)
    Div,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    /// Get the precedence of this operator (higher = binds tighter).
    pub const fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub => 7,
            BinaryOp::Mul | BinaryOp::Div => 8,
        }
    }

    /// Whether `a op (b op c)` differs from `(a op b) op c`.
    const fn is_left_associative_only(self) -> bool {
        matches!(self, BinaryOp::Sub | BinaryOp::Div)
            || self.precedence() == 3
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(&self) -> &'static str {
        match self {
            UnaryOp::Not => "NOT",
            UnaryOp::Neg => "-",
        }
    }
}

const AGGREGATES: [&str; 5] = ["COUNT", "SUM", "AVG", "MIN", "MAX"];

impl Expr {
    // ==================== Constructors ====================

    /// Create an unqualified column reference.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    /// Create a qualified column reference (table.column).
    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: column.into(),
        }
    }

    /// Create a literal value expression.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// NULL literal.
    pub fn null() -> Self {
        Expr::Literal(Value::Null)
    }

    /// Call a SQL function by name.
    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    /// COUNT(*)
    pub fn count_star() -> Self {
        Expr::CountStar
    }

    /// COALESCE function: returns the first non-NULL argument.
    pub fn coalesce(args: Vec<impl Into<Expr>>) -> Self {
        Expr::Function {
            name: "COALESCE".to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Scalar subquery.
    pub fn subquery(select: Select) -> Self {
        Expr::Subquery(Box::new(select))
    }

    /// EXISTS (subquery)
    pub fn exists(select: Select) -> Self {
        Expr::Exists {
            subquery: Box::new(select),
            negated: false,
        }
    }

    /// NOT EXISTS (subquery)
    pub fn not_exists(select: Select) -> Self {
        Expr::Exists {
            subquery: Box::new(select),
            negated: true,
        }
    }

    /// AND together all expressions; `None` when there are none.
    pub fn and_all(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(Expr::and)
    }

    /// OR together all expressions; `None` when there are none.
    pub fn or_all(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(Expr::or)
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    // ==================== Comparison ====================

    /// Equal to (=)
    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    /// Not equal to (<>)
    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    /// Less than (<)
    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    /// Less than or equal to (<=)
    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    /// Greater than (>)
    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    /// Greater than or equal to (>=)
    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    /// IS NULL
    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    /// IS NOT NULL
    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    /// IS DISTINCT FROM
    pub fn is_distinct_from(self, other: impl Into<Expr>) -> Self {
        Expr::IsDistinctFrom {
            left: Box::new(self),
            right: Box::new(other.into()),
            negated: false,
        }
    }

    /// IS NOT DISTINCT FROM
    pub fn is_not_distinct_from(self, other: impl Into<Expr>) -> Self {
        Expr::IsDistinctFrom {
            left: Box::new(self),
            right: Box::new(other.into()),
            negated: true,
        }
    }

    /// IN (values)
    pub fn in_list(self, values: Vec<impl Into<Expr>>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    /// NOT IN (values)
    pub fn not_in(self, values: Vec<impl Into<Expr>>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    // ==================== Logical ====================

    /// Logical AND
    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    /// Logical OR
    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    /// Logical NOT
    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    // ==================== Arithmetic ====================

    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    pub fn neg(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(self),
        }
    }

    /// Wrap in parentheses.
    pub fn paren(self) -> Self {
        Expr::Paren(Box::new(self))
    }

    // ==================== Functions ====================

    /// COUNT(expr) aggregate function.
    pub fn count(self) -> Self {
        Expr::function("COUNT", vec![self])
    }

    /// SUM(expr) aggregate function.
    pub fn sum(self) -> Self {
        Expr::function("SUM", vec![self])
    }

    /// AVG(expr) aggregate function.
    pub fn avg(self) -> Self {
        Expr::function("AVG", vec![self])
    }

    /// MIN(expr) aggregate function.
    pub fn min(self) -> Self {
        Expr::function("MIN", vec![self])
    }

    /// MAX(expr) aggregate function.
    pub fn max(self) -> Self {
        Expr::function("MAX", vec![self])
    }

    /// LOWER(expr)
    pub fn lower(self) -> Self {
        Expr::function("LOWER", vec![self])
    }

    /// UPPER(expr)
    pub fn upper(self) -> Self {
        Expr::function("UPPER", vec![self])
    }

    // ==================== Ordering ====================

    /// Ascending sort key.
    pub fn asc(self) -> OrderBy {
        OrderBy::new(self, OrderDirection::Asc)
    }

    /// Descending sort key.
    pub fn desc(self) -> OrderBy {
        OrderBy::new(self, OrderDirection::Desc)
    }

    // ==================== Inspection ====================

    /// Whether the expression aggregates rows (outside of nested subqueries).
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::CountStar => true,
            Expr::Function { name, args } => {
                AGGREGATES.iter().any(|a| a.eq_ignore_ascii_case(name))
                    || args.iter().any(Expr::is_aggregate)
            }
            Expr::Binary { left, right, .. } | Expr::IsDistinctFrom { left, right, .. } => {
                left.is_aggregate() || right.is_aggregate()
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Paren(expr) => {
                expr.is_aggregate()
            }
            Expr::In { expr, values, .. } => {
                expr.is_aggregate() || values.iter().any(Expr::is_aggregate)
            }
            Expr::Column { .. } | Expr::Literal(_) | Expr::Subquery(_) | Expr::Exists { .. } => {
                false
            }
        }
    }

    /// Name of the outermost function, upper-cased.
    pub fn function_name(&self) -> Option<String> {
        match self {
            Expr::CountStar => Some("COUNT".to_string()),
            Expr::Function { name, .. } => Some(name.to_ascii_uppercase()),
            Expr::Paren(inner) => inner.function_name(),
            _ => None,
        }
    }

    /// Column references, in order of appearance (outside of nested subqueries).
    pub fn columns(&self) -> Vec<(Option<&str>, &str)> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<(Option<&'a str>, &'a str)>) {
        match self {
            Expr::Column { table, name } => out.push((table.as_deref(), name.as_str())),
            Expr::Function { args, .. } => args.iter().for_each(|a| a.collect_columns(out)),
            Expr::Binary { left, right, .. } | Expr::IsDistinctFrom { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Paren(expr) => {
                expr.collect_columns(out);
            }
            Expr::In { expr, values, .. } => {
                expr.collect_columns(out);
                values.iter().for_each(|v| v.collect_columns(out));
            }
            Expr::Literal(_) | Expr::CountStar | Expr::Subquery(_) | Expr::Exists { .. } => {}
        }
    }

    /// Rewrite every column reference (outside of nested subqueries) with `f`.
    pub fn map_columns<F>(&self, f: &F) -> Expr
    where
        F: Fn(Option<&str>, &str) -> Expr,
    {
        let boxed = |e: &Expr| Box::new(e.map_columns(f));
        match self {
            Expr::Column { table, name } => f(table.as_deref(), name),
            Expr::Binary { left, op, right } => Expr::Binary {
                left: boxed(left),
                op: *op,
                right: boxed(right),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op: *op,
                expr: boxed(expr),
            },
            Expr::Function { name, args } => Expr::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.map_columns(f)).collect(),
            },
            Expr::In {
                expr,
                values,
                negated,
            } => Expr::In {
                expr: boxed(expr),
                values: values.iter().map(|v| v.map_columns(f)).collect(),
                negated: *negated,
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: boxed(expr),
                negated: *negated,
            },
            Expr::IsDistinctFrom {
                left,
                right,
                negated,
            } => Expr::IsDistinctFrom {
                left: boxed(left),
                right: boxed(right),
                negated: *negated,
            },
            Expr::Paren(expr) => Expr::Paren(boxed(expr)),
            Expr::Literal(_) | Expr::CountStar | Expr::Subquery(_) | Expr::Exists { .. } => {
                self.clone()
            }
        }
    }

    // ==================== SQL Generation ====================

    /// Build SQL with the default dialect, appending bound values to `params`.
    pub fn build(&self, params: &mut Vec<Value>, offset: usize) -> String {
        self.build_with_dialect(Dialect::default(), params, offset)
    }

    /// Build SQL for `dialect`, appending bound values to `params`.
    ///
    /// Placeholders are numbered `offset + params.len()`.
    pub fn build_with_dialect(
        &self,
        dialect: Dialect,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> String {
        match self {
            Expr::Column { table, name } => {
                if let Some(t) = table {
                    format!(
                        "{}.{}",
                        dialect.quote_identifier(t),
                        dialect.quote_identifier(name)
                    )
                } else {
                    dialect.quote_identifier(name)
                }
            }

            Expr::Literal(value) => {
                if matches!(value, Value::Default) {
                    "DEFAULT".to_string()
                } else {
                    params.push(value.clone());
                    dialect.placeholder(offset + params.len())
                }
            }

            Expr::Binary { left, op, right } => {
                let left_sql = build_operand(left, *op, false, dialect, params, offset);
                let right_sql = build_operand(right, *op, true, dialect, params, offset);
                format!("{left_sql} {} {right_sql}", op.as_str())
            }

            Expr::Unary { op, expr } => {
                let expr_sql = expr.build_with_dialect(dialect, params, offset);
                let expr_sql = if matches!(**expr, Expr::Binary { .. }) {
                    format!("({expr_sql})")
                } else {
                    expr_sql
                };
                match op {
                    UnaryOp::Not => format!("NOT {expr_sql}"),
                    UnaryOp::Neg => format!("-{expr_sql}"),
                }
            }

            Expr::Function { name, args } => {
                let arg_sqls: Vec<_> = args
                    .iter()
                    .map(|a| a.build_with_dialect(dialect, params, offset))
                    .collect();
                format!("{name}({})", arg_sqls.join(", "))
            }

            Expr::CountStar => "COUNT(*)".to_string(),

            Expr::In {
                expr,
                values,
                negated,
            } => {
                let expr_sql = expr.build_with_dialect(dialect, params, offset);
                let value_sqls: Vec<_> = values
                    .iter()
                    .map(|v| v.build_with_dialect(dialect, params, offset))
                    .collect();
                let not_str = if *negated { "NOT " } else { "" };
                format!("{expr_sql} {not_str}IN ({})", value_sqls.join(", "))
            }

            Expr::IsNull { expr, negated } => {
                let expr_sql = expr.build_with_dialect(dialect, params, offset);
                let not_str = if *negated { " NOT" } else { "" };
                format!("{expr_sql} IS{not_str} NULL")
            }

            Expr::IsDistinctFrom {
                left,
                right,
                negated,
            } => {
                let left_sql = left.build_with_dialect(dialect, params, offset);
                let right_sql = right.build_with_dialect(dialect, params, offset);
                if dialect.supports_is_distinct_from() {
                    let not_str = if *negated { " NOT" } else { "" };
                    format!("{left_sql} IS{not_str} DISTINCT FROM {right_sql}")
                } else if *negated {
                    format!("{left_sql} <=> {right_sql}")
                } else {
                    format!("NOT ({left_sql} <=> {right_sql})")
                }
            }

            Expr::Subquery(select) => {
                format!("({})", select.build_into(dialect, params, offset))
            }

            Expr::Exists { subquery, negated } => {
                let not_str = if *negated { "NOT " } else { "" };
                format!(
                    "{not_str}EXISTS ({})",
                    subquery.build_into(dialect, params, offset)
                )
            }

            Expr::Paren(expr) => {
                let expr_sql = expr.build_with_dialect(dialect, params, offset);
                format!("({expr_sql})")
            }
        }
    }
}

/// Render a binary operand, parenthesizing it when precedence requires.
fn build_operand(
    operand: &Expr,
    parent: BinaryOp,
    right: bool,
    dialect: Dialect,
    params: &mut Vec<Value>,
    offset: usize,
) -> String {
    let sql = operand.build_with_dialect(dialect, params, offset);
    let wrap = match operand {
        Expr::Binary { op, .. } => {
            op.precedence() < parent.precedence()
                || (right && op.precedence() == parent.precedence() && parent.is_left_associative_only())
        }
        _ => false,
    };
    if wrap { format!("({sql})") } else { sql }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self {
        Expr::Literal(Value::Bool(v))
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Literal(Value::Int(v))
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Literal(Value::BigInt(v))
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Literal(Value::Double(v))
    }
}

impl From<&str> for Expr {
    fn from(v: &str) -> Self {
        Expr::Literal(Value::Text(v.to_string()))
    }
}

impl From<String> for Expr {
    fn from(v: String) -> Self {
        Expr::Literal(Value::Text(v))
    }
}
