use chrono::{DateTime, NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::directory::ProfilePatch;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTenant {
        id: Ulid,
        name: String,
        subdomain: Option<String>,
        timezone: Option<Tz>,
        slot_step_minutes: Option<u32>,
        returning: bool,
    },
    UpdateTenant {
        id: Ulid,
        patch: ProfilePatch,
    },
    SelectTenants {
        subdomain: Option<String>,
    },
    InsertService {
        id: Ulid,
        name: String,
        duration_minutes: u32,
        price_cents: i64,
    },
    UpdateService {
        id: Ulid,
        name: Option<String>,
        duration_minutes: Option<u32>,
        price_cents: Option<i64>,
    },
    DeleteService {
        id: Ulid,
    },
    SelectServices,
    InsertStaff {
        id: Ulid,
        name: String,
        title: String,
        photo_url: Option<String>,
    },
    UpdateStaff {
        id: Ulid,
        name: Option<String>,
        title: Option<String>,
        photo_url: Option<Option<String>>,
    },
    DeleteStaff {
        id: Ulid,
    },
    SelectStaff,
    InsertAvailability {
        staff_id: Ulid,
        rule: AvailabilityRule,
    },
    SelectAvailability {
        staff_id: Ulid,
    },
    InsertTimeOff {
        time_off: TimeOff,
    },
    DeleteTimeOff {
        id: Ulid,
    },
    SelectTimeOff {
        staff_id: Ulid,
    },
    SelectSlots {
        staff_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    },
    InsertBooking {
        id: Ulid,
        service_id: Ulid,
        staff_id: Ulid,
        start: Ms,
        customer_name: String,
        customer_email: String,
        returning: bool,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        staff_id: Option<Ulid>,
    },
    SelectBookingDensity {
        from: NaiveDate,
        to: NaiveDate,
        staff_id: Option<Ulid>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

/// Parse a single statement. Anything after the first is ignored.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let first = stmts.first().ok_or(SqlError::Empty)?;
    parse_statement(first)
}

/// Parse every `;`-separated statement of a simple query.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "tenants" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("tenants", 2, values.len()));
            }
            Ok(Command::InsertTenant {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                subdomain: optional(&values, 2, parse_string_or_null)?,
                timezone: optional(&values, 3, parse_tz_or_null)?,
                slot_step_minutes: optional(&values, 4, parse_u32_or_null)?,
                returning,
            })
        }
        "services" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("services", 4, values.len()));
            }
            Ok(Command::InsertService {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                duration_minutes: parse_u32(&values[2])?,
                price_cents: parse_i64(&values[3])?,
            })
        }
        "staff" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("staff", 3, values.len()));
            }
            Ok(Command::InsertStaff {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                title: parse_string(&values[2])?,
                photo_url: optional(&values, 3, parse_string_or_null)?,
            })
        }
        "availability" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("availability", 5, values.len()));
            }
            Ok(Command::InsertAvailability {
                staff_id: parse_ulid(&values[0])?,
                rule: AvailabilityRule {
                    day: parse_weekday(&values[1])?,
                    is_working: parse_bool(&values[2])?,
                    start_time: parse_time(&values[3])?,
                    end_time: parse_time(&values[4])?,
                },
            })
        }
        "time_off" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("time_off", 4, values.len()));
            }
            let start_date = parse_date(&values[2])?;
            Ok(Command::InsertTimeOff {
                time_off: TimeOff {
                    id: parse_ulid(&values[0])?,
                    staff_id: parse_ulid(&values[1])?,
                    start_date,
                    // Single-day entries may leave the end date out.
                    end_date: parse_date_or_null(&values[3])?.unwrap_or(start_date),
                    reason: optional(&values, 4, parse_string_or_null)?,
                    start_time: optional(&values, 5, parse_time_or_null)?,
                    end_time: optional(&values, 6, parse_time_or_null)?,
                },
            })
        }
        "bookings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                service_id: parse_ulid(&values[1])?,
                staff_id: parse_ulid(&values[2])?,
                start: parse_instant(&values[3])?,
                customer_name: parse_string(&values[4])?,
                customer_email: parse_string(&values[5])?,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((col, &a.value));
    }
    if sets.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "tenants" => {
            let mut patch = ProfilePatch::default();
            for (col, value) in sets {
                match col.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "timezone" => {
                        patch.timezone = Some(
                            parse_tz_or_null(value)?
                                .ok_or(SqlError::Parse("timezone cannot be NULL".into()))?,
                        )
                    }
                    "slot_step_minutes" => patch.slot_step_minutes = Some(parse_u32_or_null(value)?),
                    "headline" => patch.headline = Some(parse_string_or_null(value)?),
                    "description" => patch.description = Some(parse_string_or_null(value)?),
                    "address" => patch.address = Some(parse_string_or_null(value)?),
                    "logo_url" => patch.logo_url = Some(parse_string_or_null(value)?),
                    "subdomain" => {
                        return Err(SqlError::Unsupported("subdomain cannot be changed".into()));
                    }
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateTenant { id, patch })
        }
        "services" => {
            let (mut name, mut duration_minutes, mut price_cents) = (None, None, None);
            for (col, value) in sets {
                match col.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "duration_minutes" => duration_minutes = Some(parse_u32(value)?),
                    "price_cents" => price_cents = Some(parse_i64(value)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateService { id, name, duration_minutes, price_cents })
        }
        "staff" => {
            let (mut name, mut title, mut photo_url) = (None, None, None);
            for (col, value) in sets {
                match col.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "title" => title = Some(parse_string(value)?),
                    "photo_url" => photo_url = Some(parse_string_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateStaff { id, name, title, photo_url })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "staff" => Ok(Command::DeleteStaff { id }),
        "time_off" => Ok(Command::DeleteTimeOff { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// A `column op value` predicate from a WHERE clause of ANDed comparisons.
struct Filter<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)?;
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push(Filter { column, op: op.clone(), value: right });
        }
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => {
            let column = expr_column_name(expr)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {expr}")))?;
            out.push(Filter { column: column.clone(), op: BinaryOperator::GtEq, value: low });
            out.push(Filter { column, op: BinaryOperator::LtEq, value: high });
        }
        Expr::Nested(inner) => collect_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
    Ok(())
}

fn find_filter<'a>(filters: &[Filter<'a>], column: &str, op: BinaryOperator) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|f| f.column == column && f.op == op)
        .map(|f| f.value)
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let eq = |col: &'static str| find_filter(&filters, col, BinaryOperator::Eq);
    let required_ulid = |col: &'static str| -> Result<Ulid, SqlError> {
        parse_ulid(eq(col).ok_or(SqlError::MissingFilter(col))?)
    };
    let optional_ulid = |col: &'static str| -> Result<Option<Ulid>, SqlError> {
        eq(col).map(parse_ulid).transpose()
    };

    match table.as_str() {
        "tenants" => Ok(Command::SelectTenants {
            subdomain: eq("subdomain").map(parse_string).transpose()?,
        }),
        "services" => Ok(Command::SelectServices),
        "staff" => Ok(Command::SelectStaff),
        "availability" => Ok(Command::SelectAvailability {
            staff_id: required_ulid("staff_id")?,
        }),
        "time_off" => Ok(Command::SelectTimeOff {
            staff_id: required_ulid("staff_id")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            staff_id: required_ulid("staff_id")?,
            service_id: required_ulid("service_id")?,
            date: parse_date(eq("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            staff_id: optional_ulid("staff_id")?,
        }),
        "booking_density" => {
            let from = find_filter(&filters, "date", BinaryOperator::GtEq)
                .ok_or(SqlError::MissingFilter("date >="))?;
            let to = find_filter(&filters, "date", BinaryOperator::LtEq)
                .ok_or(SqlError::MissingFilter("date <="))?;
            Ok(Command::SelectBookingDensity {
                from: parse_date(from)?,
                to: parse_date(to)?,
                staff_id: optional_ulid("staff_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
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
        SetExpr::Values(values) => match values.rows.len() {
            0 => Err(SqlError::Parse("empty VALUES".into())),
            1 => Ok(values.rows[0].clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Parse `values[idx]` if present; a missing trailing value reads as NULL.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map_or(Ok(None), parse)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_date(expr).map(Some)
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<NaiveTime>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_time(expr).map(Some)
}

/// Weekday by name (`'mon'`, `'Monday'`) or ISO number (`1` = Monday … `7` = Sunday).
fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    const ISO_WEEK: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
    if let Ok(n) = parse_i64(expr) {
        return match n {
            1..=7 => Ok(ISO_WEEK[(n - 1) as usize]),
            _ => Err(SqlError::Parse(format!("weekday {n} out of range 1-7"))),
        };
    }
    let s = parse_string(expr)?;
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| SqlError::Parse(format!("bad weekday {s:?}")))
}

fn parse_tz_or_null(expr: &Expr) -> Result<Option<Tz>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let s = parse_string(expr)?;
    s.trim()
        .parse::<Tz>()
        .map(Some)
        .map_err(|e| SqlError::Parse(format!("bad time zone {s:?}: {e}")))
}

/// Unix milliseconds, or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Ok(ms) = parse_i64(expr) {
        return Ok(ms);
    }
    let s = parse_string(expr)?;
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")))
}
