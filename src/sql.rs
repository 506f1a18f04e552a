use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCourse {
        spec: CourseSpec,
    },
    SelectCourses {
        id: Option<CourseId>,
    },
    InsertStudent {
        id: StudentId,
        name: String,
        email: String,
        password: String,
    },
    Login {
        email: String,
        password: String,
    },
    Logout {
        token: String,
    },
    SelectProfile {
        token: String,
    },
    Enroll {
        token: String,
        course_id: CourseId,
    },
    Drop {
        token: String,
        course_id: CourseId,
    },
}

const COURSE_COLUMNS: &[&str] = &["id", "name", "capacity", "start_date", "end_date", "enroll_by"];
const STUDENT_COLUMNS: &[&str] = &["id", "name", "email", "password"];
const ENROLLMENT_COLUMNS: &[&str] = &["token", "course_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "courses" => {
            let row = insert_row(insert, "courses", COURSE_COLUMNS)?;
            let mut spec = CourseSpec::new(
                parse_string(column(&row, "id")?)?,
                parse_string(column(&row, "name")?)?,
                parse_u32(column(&row, "capacity")?)?,
            );
            spec.start_date = optional_date(&row, "start_date")?;
            spec.end_date = optional_date(&row, "end_date")?;
            spec.enroll_by = optional_date(&row, "enroll_by")?;
            Ok(Command::InsertCourse { spec })
        }
        "students" => {
            let row = insert_row(insert, "students", STUDENT_COLUMNS)?;
            Ok(Command::InsertStudent {
                id: parse_string(column(&row, "id")?)?,
                name: parse_string(column(&row, "name")?)?,
                email: parse_string(column(&row, "email")?)?,
                password: parse_string(column(&row, "password")?)?,
            })
        }
        "enrollments" => {
            let row = insert_row(insert, "enrollments", ENROLLMENT_COLUMNS)?;
            Ok(Command::Enroll {
                token: parse_string(column(&row, "token")?)?,
                course_id: parse_string(column(&row, "course_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection)?;

    match table.as_str() {
        "sessions" => Ok(Command::Logout {
            token: required_filter(&filters, "token")?,
        }),
        "enrollments" => Ok(Command::Drop {
            token: required_filter(&filters, "token")?,
            course_id: required_filter(&filters, "course_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = where_filters(&select.selection)?;

    match table.as_str() {
        "courses" => Ok(Command::SelectCourses {
            id: filters.get("id").map(parse_string).transpose()?,
        }),
        "sessions" => Ok(Command::Login {
            email: required_filter(&filters, "email")?,
            password: required_filter(&filters, "password")?,
        }),
        "students" => Ok(Command::SelectProfile {
            token: required_filter(&filters, "token")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `col = value` terms joined by AND.
fn collect_eq_filters(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref().clone());
            }
            other => return Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

fn where_filters(selection: &Option<Expr>) -> Result<HashMap<String, Expr>, SqlError> {
    let mut filters = HashMap::new();
    if let Some(sel) = selection {
        collect_eq_filters(sel, &mut filters)?;
    }
    Ok(filters)
}

fn required_filter(filters: &HashMap<String, Expr>, col: &'static str) -> Result<String, SqlError> {
    parse_string(filters.get(col).ok_or(SqlError::MissingFilter(col))?)
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.len() != 1 {
                return Err(SqlError::Parse("expected exactly one VALUES row".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Pair the single VALUES row with its column names: the explicit column list if given,
/// otherwise the table's columns in declaration order.
fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    table_columns: &[&'static str],
) -> Result<HashMap<String, Expr>, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() > table_columns.len() {
            return Err(SqlError::WrongArity(table, table_columns.len(), values.len()));
        }
        table_columns.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    for col in &columns {
        if !table_columns.contains(&col.as_str()) {
            return Err(SqlError::UnknownColumn(table, col.clone()));
        }
    }
    Ok(columns.into_iter().zip(values).collect())
}

fn column<'a>(row: &'a HashMap<String, Expr>, col: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(col).ok_or(SqlError::MissingColumn(col))
}

fn optional_date(row: &HashMap<String, Expr>, col: &'static str) -> Result<Option<NaiveDate>, SqlError> {
    match row.get(col) {
        Some(expr) => parse_date_or_null(expr),
        None => Ok(None),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// `NULL` and `''` mean "no date"; anything else must be `YYYY-MM-DD`.
fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected date or NULL, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
