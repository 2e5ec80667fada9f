use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{parse_date, parse_time};
use crate::engine::Keep;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUnit {
        id: Ulid,
        name: String,
        category: Option<String>,
        window: Window,
        capacity: u32,
    },
    UpdateUnit {
        id: Ulid,
        name: Option<String>,
        active: Option<bool>,
    },
    InsertOverride {
        id: Ulid,
        rule: Override,
    },
    DeleteOverride {
        id: Ulid,
    },
    GrantRole {
        holder: String,
        role: String,
    },
    RevokeRole {
        holder: String,
        role: String,
    },
    InsertBooking {
        unit_id: Ulid,
        date: NaiveDate,
        holder: String,
        note: Option<String>,
        force: bool,
    },
    RescheduleBooking {
        token: String,
        unit_id: Ulid,
        date: NaiveDate,
    },
    ResolveConflict {
        id: Ulid,
        keep: Keep,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
    },
    CancelBooking {
        token: String,
        reason: Option<String>,
    },
    InsertSeries {
        holder: String,
        unit_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        pattern: Pattern,
        force: bool,
    },
    CancelSeries {
        id: Ulid,
        from: Option<NaiveDate>,
        reason: Option<String>,
    },
    SelectAvailability {
        date: NaiveDate,
        include_past: bool,
    },
    SelectDay {
        date: NaiveDate,
    },
    SelectUnits,
    SelectBookings(BookingFilter),
    SelectSeries(SeriesFilter),
    SelectOverrides,
    SelectRoles {
        holder: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Ulid),
    Token(String),
    Holder(String),
    Unit { unit_id: Ulid, date: Option<NaiveDate> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesFilter {
    Id(Ulid),
    Holder(String),
}

/// A command and the book its table was qualified with (`pantry.` by default).
#[derive(Debug, PartialEq)]
pub struct Parsed {
    pub book: Book,
    pub command: Command,
}

pub fn parse_sql(sql: &str) -> Result<Parsed, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

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

/// Kind of rows a statement answers with, known before parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Command tag only.
    Tag,
    /// One admission outcome row.
    Outcome,
    /// One outcome row per candidate date of a series.
    SeriesOutcome,
    Bookings,
    Availability,
    Day,
    Units,
    Series,
    Overrides,
    Roles,
}

pub fn result_shape(sql: &str) -> ResultShape {
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return ResultShape::Tag;
    };
    let table = |r: Result<(Book, String), SqlError>| r.map(|(_, t)| t).unwrap_or_default();
    match stmts.first() {
        Some(Statement::Insert(insert)) => match table(insert_table_name(insert)).as_str() {
            "bookings" => ResultShape::Outcome,
            "series" => ResultShape::SeriesOutcome,
            _ => ResultShape::Tag,
        },
        Some(Statement::Update {
            table: target,
            assignments,
            ..
        }) => match table(table_factor_name(&target.relation)).as_str() {
            "bookings" if assignments.iter().any(|a| column_key(&a.target.to_string()) == "status") => {
                ResultShape::Bookings
            }
            "bookings" => ResultShape::Outcome,
            "series" => ResultShape::Bookings,
            _ => ResultShape::Tag,
        },
        Some(Statement::Delete(delete)) => match table(delete_table_name(delete)).as_str() {
            "bookings" => ResultShape::Bookings,
            _ => ResultShape::Tag,
        },
        Some(Statement::Query(query)) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return ResultShape::Tag;
            };
            let Some(from) = select.from.first() else {
                return ResultShape::Tag;
            };
            match table(table_factor_name(&from.relation)).as_str() {
                "availability" => ResultShape::Availability,
                "days" => ResultShape::Day,
                "units" => ResultShape::Units,
                "bookings" => ResultShape::Bookings,
                "series" => ResultShape::Series,
                "overrides" => ResultShape::Overrides,
                "roles" => ResultShape::Roles,
                _ => ResultShape::Tag,
            }
        }
        _ => ResultShape::Tag,
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "units" => &["id", "name", "category", "start_time", "end_time", "capacity"],
        "blocks" => &["id", "unit_id", "date", "reason"],
        "recurring_blocks" => &["id", "unit_id", "weekday", "week", "reason"],
        "breaks" => &["id", "unit_id", "weekday", "reason"],
        "holidays" => &["id", "date", "reason"],
        "roles" => &["holder", "role"],
        "bookings" => &["unit_id", "date", "holder", "note", "force"],
        "series" => &["holder", "unit_id", "start_date", "end_date", "pattern", "weekdays", "force"],
        _ => return None,
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Parsed, SqlError> {
    let (book, table) = insert_table_name(insert)?;
    let defaults = default_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| column_key(&c.to_string())).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    let row = Fields::new(columns.into_iter().zip(values).collect());

    let command = match table.as_str() {
        "units" => Command::InsertUnit {
            id: row.ulid("id")?,
            name: row.string("name")?,
            category: row.opt_string("category")?,
            window: row.window("start_time", "end_time")?,
            capacity: row.u32("capacity")?,
        },
        "blocks" => Command::InsertOverride {
            id: row.ulid("id")?,
            rule: Override::Block {
                unit_id: row.ulid("unit_id")?,
                date: row.date("date")?,
                reason: row.opt_string("reason")?.unwrap_or_default(),
            },
        },
        "recurring_blocks" => Command::InsertOverride {
            id: row.ulid("id")?,
            rule: Override::RecurringBlock {
                unit_id: row.ulid("unit_id")?,
                weekday: row.weekday("weekday")?,
                week: row.u32("week")?,
                reason: row.opt_string("reason")?.unwrap_or_default(),
            },
        },
        "breaks" => Command::InsertOverride {
            id: row.ulid("id")?,
            rule: Override::Break {
                unit_id: row.ulid("unit_id")?,
                weekday: row.weekday("weekday")?,
                reason: row.opt_string("reason")?.unwrap_or_default(),
            },
        },
        "holidays" => Command::InsertOverride {
            id: row.ulid("id")?,
            rule: Override::Holiday {
                date: row.date("date")?,
                reason: row.opt_string("reason")?.unwrap_or_default(),
            },
        },
        "roles" => Command::GrantRole {
            holder: row.string("holder")?,
            role: row.string("role")?,
        },
        "bookings" => Command::InsertBooking {
            unit_id: row.ulid("unit_id")?,
            date: row.date("date")?,
            holder: row.string("holder")?,
            note: row.opt_string("note")?,
            force: row.opt_bool("force")?.unwrap_or(false),
        },
        "series" => Command::InsertSeries {
            holder: row.string("holder")?,
            unit_id: row.ulid("unit_id")?,
            start: row.date("start_date")?,
            end: row.date("end_date")?,
            pattern: row.pattern("pattern", "weekdays")?,
            force: row.opt_bool("force")?.unwrap_or(false),
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    Ok(Parsed { book, command })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Parsed, SqlError> {
    let (book, table) = table_factor_name(&table.relation)?;
    let set = Fields::new(
        assignments
            .iter()
            .map(|a| (column_key(&a.target.to_string()), a.value.clone()))
            .collect(),
    );
    let filter = where_equalities(selection)?;

    let command = match table.as_str() {
        "units" => Command::UpdateUnit {
            id: filter.ulid("id")?,
            name: set.opt_string("name")?,
            active: set.opt_bool("active")?,
        },
        "bookings" if set.has("keep") => {
            let id = filter.ulid("id")?;
            let keep = match set.string("keep")?.to_lowercase().as_str() {
                "existing" => Keep::Existing,
                "new" => Keep::New {
                    unit_id: set.ulid("unit_id")?,
                    date: set.date("date")?,
                    note: set.opt_string("note")?,
                    force: set.opt_bool("force")?.unwrap_or(false),
                },
                other => return Err(SqlError::InvalidValue("keep", other.to_string())),
            };
            Command::ResolveConflict { id, keep }
        }
        "bookings" if set.has("status") => {
            let status = set.string("status")?;
            Command::UpdateBookingStatus {
                id: filter.ulid("id")?,
                status: BookingStatus::parse(&status)
                    .ok_or(SqlError::InvalidValue("status", status))?,
                reason: set.opt_string("reason")?,
            }
        }
        "bookings" => Command::RescheduleBooking {
            token: filter.string("token")?,
            unit_id: set.ulid("unit_id")?,
            date: set.date("date")?,
        },
        "series" => {
            if set.opt_bool("active")? != Some(false) {
                return Err(SqlError::Unsupported("series can only be deactivated".into()));
            }
            Command::CancelSeries {
                id: filter.ulid("id")?,
                from: filter.opt_date("from_date")?,
                reason: set.opt_string("reason")?,
            }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    Ok(Parsed { book, command })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Parsed, SqlError> {
    let (book, table) = delete_table_name(delete)?;
    let filter = where_equalities(&delete.selection)?;

    let command = match table.as_str() {
        "blocks" | "recurring_blocks" | "breaks" | "holidays" | "overrides" => {
            Command::DeleteOverride { id: filter.ulid("id")? }
        }
        "roles" => Command::RevokeRole {
            holder: filter.string("holder")?,
            role: filter.string("role")?,
        },
        "bookings" => Command::CancelBooking {
            token: filter.string("token")?,
            reason: filter.opt_string("reason")?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    Ok(Parsed { book, command })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Parsed, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let (book, table) = table_factor_name(&from.relation)?;
    let filter = where_equalities(&select.selection)?;

    let command = match table.as_str() {
        "availability" => Command::SelectAvailability {
            date: filter.date("date").map_err(as_filter("date"))?,
            include_past: filter.opt_bool("include_past")?.unwrap_or(false),
        },
        "days" => Command::SelectDay {
            date: filter.date("date").map_err(as_filter("date"))?,
        },
        "units" => Command::SelectUnits,
        "bookings" => {
            let by = if filter.has("id") {
                BookingFilter::Id(filter.ulid("id")?)
            } else if filter.has("token") {
                BookingFilter::Token(filter.string("token")?)
            } else if filter.has("holder") {
                BookingFilter::Holder(filter.string("holder")?)
            } else if filter.has("unit_id") {
                BookingFilter::Unit {
                    unit_id: filter.ulid("unit_id")?,
                    date: filter.opt_date("date")?,
                }
            } else {
                return Err(SqlError::MissingFilter("id, token, holder or unit_id"));
            };
            Command::SelectBookings(by)
        }
        "series" => {
            let by = if filter.has("id") {
                SeriesFilter::Id(filter.ulid("id")?)
            } else {
                SeriesFilter::Holder(filter.string("holder").map_err(as_filter("holder"))?)
            };
            Command::SelectSeries(by)
        }
        "overrides" => Command::SelectOverrides,
        "roles" => Command::SelectRoles {
            holder: filter.string("holder").map_err(as_filter("holder"))?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    Ok(Parsed { book, command })
}

fn as_filter(col: &'static str) -> impl Fn(SqlError) -> SqlError {
    move |e| match e {
        SqlError::MissingColumn(_) => SqlError::MissingFilter(col),
        other => other,
    }
}

/// Collect `col = value` conjuncts of a WHERE clause. Other predicates are ignored.
fn where_equalities(selection: &Option<Expr>) -> Result<Fields, SqlError> {
    let mut pairs = Vec::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut pairs);
    }
    Ok(Fields::new(pairs))
}

fn collect_equalities(expr: &Expr, out: &mut Vec<(String, Expr)>) {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_equalities(left, out);
                collect_equalities(right, out);
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, right.as_ref().clone()));
                }
            }
            _ => {}
        },
        _ => {}
    }
}

// ── Row access ────────────────────────────────────────────────

/// Named values of one INSERT row, SET list, or WHERE clause.
struct Fields {
    values: Vec<(String, Expr)>,
}

impl Fields {
    fn new(values: Vec<(String, Expr)>) -> Self {
        Self { values }
    }

    fn has(&self, col: &str) -> bool {
        self.values.iter().any(|(c, _)| c == col)
    }

    fn get(&self, col: &str) -> Option<&Expr> {
        self.values.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    /// Text of the column, `None` when absent or NULL.
    fn text(&self, col: &str) -> Result<Option<String>, SqlError> {
        match self.get(col) {
            Some(expr) => expr_text(expr),
            None => Ok(None),
        }
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        self.text(col)?.ok_or(SqlError::MissingColumn(col))
    }

    fn opt_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.text(col)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        let expr = self.get(col).ok_or(SqlError::MissingColumn(col))?;
        parse_ulid_expr(expr)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        self.opt_date(col)?.ok_or(SqlError::MissingColumn(col))
    }

    fn opt_date(&self, col: &'static str) -> Result<Option<NaiveDate>, SqlError> {
        match self.text(col)? {
            Some(s) => parse_date(&s).map(Some).ok_or(SqlError::InvalidValue(col, s)),
            None => Ok(None),
        }
    }

    fn time(&self, col: &'static str) -> Result<NaiveTime, SqlError> {
        let s = self.string(col)?;
        parse_time(&s).ok_or(SqlError::InvalidValue(col, s))
    }

    fn window(&self, start: &'static str, end: &'static str) -> Result<Window, SqlError> {
        let (from, until) = (self.time(start)?, self.time(end)?);
        if from >= until {
            return Err(SqlError::InvalidValue(end, format!("{until} is not after {from}")));
        }
        Ok(Window::new(from, until))
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        let expr = self.get(col).ok_or(SqlError::MissingColumn(col))?;
        parse_u32(expr)
    }

    fn opt_bool(&self, col: &str) -> Result<Option<bool>, SqlError> {
        match self.get(col) {
            Some(expr) if is_null(expr) => Ok(None),
            Some(expr) => parse_bool(expr).map(Some),
            None => Ok(None),
        }
    }

    fn weekday(&self, col: &'static str) -> Result<Weekday, SqlError> {
        let s = self.string(col)?;
        parse_weekday(&s).ok_or(SqlError::InvalidValue(col, s))
    }

    fn pattern(&self, col: &'static str, days_col: &'static str) -> Result<Pattern, SqlError> {
        let kind = self.string(col)?;
        match kind.to_lowercase().as_str() {
            "daily" => Ok(Pattern::Daily),
            "weekly" => {
                let days = self.text(days_col)?.unwrap_or_default();
                let parsed = days
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(|d| parse_weekday(d).ok_or_else(|| SqlError::InvalidValue(days_col, d.to_string())))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Pattern::weekly(parsed))
            }
            _ => Err(SqlError::InvalidValue(col, kind)),
        }
    }
}

/// Weekday by name (`monday`, `mon`) or ISO number (1 = Monday).
fn parse_weekday(s: &str) -> Option<Weekday> {
    let s = s.trim();
    if let Ok(n) = s.parse::<usize>() {
        const ISO: [Weekday; 7] = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        return ISO.get(n.checked_sub(1)?).copied();
    }
    s.parse::<Weekday>().ok()
}

// ── Helpers ───────────────────────────────────────────────────

/// Lowercased column name with quotes and any qualifier stripped.
fn column_key(raw: &str) -> String {
    raw.rsplit('.').next().unwrap_or(raw).trim_matches('"').to_lowercase()
}

/// Split `[schema.]table` into the book it addresses and the table name.
fn table_ref(name: &ast::ObjectName) -> Result<(Book, String), SqlError> {
    let parts: Vec<String> = name
        .0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
            _ => None,
        })
        .collect();
    match parts.as_slice() {
        [] => Err(SqlError::Parse("empty table name".into())),
        [table] => Ok((Book::Pantry, table.clone())),
        [.., schema, table] => Book::parse(schema)
            .map(|book| (book, table.clone()))
            .ok_or_else(|| SqlError::UnknownSchema(schema.clone())),
    }
}

fn insert_table_name(insert: &ast::Insert) -> Result<(Book, String), SqlError> {
    match &insert.table {
        TableObject::TableName(name) => table_ref(name),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<(Book, String), SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<(Book, String), SqlError> {
    match tf {
        TableFactor::Table { name, .. } => table_ref(name),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

/// Literal as text. NULL is `None`.
fn expr_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
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

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

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
    #[error("unknown schema: {0} (expected pantry or volunteer)")]
    UnknownSchema(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownSchema(_) => "3F000",
            SqlError::InvalidValue(..) => "22007",
            _ => "42601",
        }
    }
}
