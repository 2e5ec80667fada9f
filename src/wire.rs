use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::auth::{Access, LarderAuthSource};
use crate::calendar::{DayStatus, SlotAvailability};
use crate::engine::{
    AdmissionRequest, Engine, EngineError, Occurrence, Rejection, ResolveRequest, SeriesRequest,
};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, Parsed, ResultShape, SeriesFilter};
use crate::tenant::{Organization, TenantManager};

pub struct LarderHandler {
    tenant_manager: Arc<TenantManager>,
    access: Access,
    query_parser: Arc<LarderQueryParser>,
}

impl LarderHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, access: Access) -> Self {
        Self {
            tenant_manager,
            access,
            query_parser: Arc::new(LarderQueryParser),
        }
    }

    fn resolve_session<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Organization>, Actor)> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let user = metadata.get("user").cloned().unwrap_or_default();
        let actor = if self.access.is_staff(&user) {
            Actor::Staff
        } else {
            Actor::Holder(user)
        };
        let org = self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })?;
        Ok((org, actor))
    }

    async fn run(&self, org: &Organization, actor: &Actor, sql: &str) -> PgWireResult<Response> {
        let parsed = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&parsed.command);
        let started = Instant::now();
        let result = self.execute_command(org, actor, parsed).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        org: &Organization,
        actor: &Actor,
        Parsed { book, command }: Parsed,
    ) -> PgWireResult<Response> {
        let engine: &Engine = org.engine(book);
        match command {
            Command::InsertUnit {
                id,
                name,
                category,
                window,
                capacity,
            } => {
                require_staff(actor)?;
                engine
                    .create_unit(id, name, category, window, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateUnit { id, name, active } => {
                require_staff(actor)?;
                engine.update_unit(id, name, active).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertOverride { id, rule } => {
                require_staff(actor)?;
                engine.add_override(id, rule).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteOverride { id } => {
                require_staff(actor)?;
                engine.remove_override(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::GrantRole { holder, role } => {
                require_staff(actor)?;
                engine.grant_role(holder, role).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::RevokeRole { holder, role } => {
                require_staff(actor)?;
                engine.revoke_role(holder, role).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                unit_id,
                date,
                holder,
                note,
                force,
            } => {
                let result = engine
                    .admit(AdmissionRequest {
                        unit_id,
                        date,
                        holder,
                        note,
                        force,
                        actor: actor.clone(),
                    })
                    .await;
                let row = match result {
                    Ok(admitted) => Outcome::admitted(&admitted.booking, admitted.raised_to),
                    Err(e) => Outcome::refused(e)?,
                };
                Ok(outcome_response(row))
            }
            Command::RescheduleBooking {
                token,
                unit_id,
                date,
            } => {
                let row = match engine.reschedule(&token, unit_id, date).await {
                    Ok(moved) => Outcome::admitted(&moved.booking, None),
                    Err(e) => Outcome::refused(e)?,
                };
                Ok(outcome_response(row))
            }
            Command::ResolveConflict { id, keep } => {
                let result = engine
                    .resolve_conflict(ResolveRequest {
                        existing_id: id,
                        keep,
                        actor: actor.clone(),
                    })
                    .await;
                let row = match result {
                    Ok(resolution) => {
                        let raised_to = match &resolution {
                            crate::engine::Resolution::KeptNew { raised_to, .. } => *raised_to,
                            crate::engine::Resolution::KeptExisting(_) => None,
                        };
                        let mut row = Outcome::admitted(resolution.booking(), raised_to);
                        row.message = format!("kept {}", resolution.kept());
                        row
                    }
                    Err(e) => Outcome::refused(e)?,
                };
                Ok(outcome_response(row))
            }
            Command::UpdateBookingStatus { id, status, reason } => {
                let booking = engine
                    .update_status(id, status, reason, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(bookings_response(vec![booking]))
            }
            Command::CancelBooking { token, reason } => {
                let booking = engine
                    .cancel_by_token(&token, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(bookings_response(vec![booking]))
            }
            Command::InsertSeries {
                holder,
                unit_id,
                start,
                end,
                pattern,
                force,
            } => {
                let report = engine
                    .admit_series(SeriesRequest {
                        holder,
                        unit_id,
                        start,
                        end,
                        pattern,
                        force,
                        actor: actor.clone(),
                    })
                    .await
                    .map_err(engine_err)?;
                let mut rows: Vec<SeriesRow> = report
                    .bookings
                    .iter()
                    .map(|b| SeriesRow {
                        series_id: report.series_id.to_string(),
                        date: b.date,
                        outcome: Outcome::admitted(b, report.raised_to),
                    })
                    .chain(report.skipped.iter().map(|s| SeriesRow {
                        series_id: report.series_id.to_string(),
                        date: s.date,
                        outcome: Outcome::rejected(&s.reason),
                    }))
                    .collect();
                rows.sort_by_key(|r| r.date);
                Ok(series_outcome_response(rows))
            }
            Command::CancelSeries { id, from, reason } => {
                let from = from.unwrap_or_else(|| engine.clock().today());
                let cancelled = engine
                    .cancel_series(id, from, reason, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(bookings_response(cancelled))
            }
            Command::SelectAvailability { date, include_past } => {
                let slots = engine.availability(date, include_past).await;
                Ok(availability_response(slots))
            }
            Command::SelectDay { date } => {
                let status = engine.day_status(date).await;
                Ok(day_response(date, status))
            }
            Command::SelectUnits => Ok(units_response(engine.list_units().await)),
            Command::SelectBookings(filter) => {
                let mut rows = match &filter {
                    BookingFilter::Id(id) => vec![engine.get_booking(*id).await.map_err(engine_err)?],
                    BookingFilter::Token(token) => {
                        vec![engine.booking_by_token(token).await.map_err(engine_err)?]
                    }
                    BookingFilter::Holder(holder) => engine.bookings_for_holder(holder).await,
                    BookingFilter::Unit { unit_id, date } => engine
                        .bookings_for_unit(*unit_id, *date)
                        .await
                        .map_err(engine_err)?,
                };
                // A token is its own capability; everything else is scoped to the caller.
                if !matches!(filter, BookingFilter::Token(_)) {
                    rows.retain(|b| actor.may_act_for(&b.holder));
                }
                Ok(bookings_response(rows))
            }
            Command::SelectSeries(filter) => {
                let mut rows = match filter {
                    SeriesFilter::Id(id) => vec![engine.get_series(id).map_err(engine_err)?],
                    SeriesFilter::Holder(holder) => engine.series_for_holder(&holder),
                };
                rows.retain(|s| actor.may_act_for(&s.holder));
                Ok(series_response(rows))
            }
            Command::SelectOverrides => Ok(overrides_response(engine.list_overrides().await)),
            Command::SelectRoles { holder } => {
                if !actor.may_act_for(&holder) {
                    return Err(engine_err(
                        Rejection::Forbidden("holders may only list their own roles").into(),
                    ));
                }
                let roles = engine.roles_for(&holder);
                Ok(roles_response(&holder, roles))
            }
        }
    }
}

fn require_staff(actor: &Actor) -> PgWireResult<()> {
    if actor.is_staff() {
        Ok(())
    } else {
        Err(engine_err(Rejection::Forbidden("staff only").into()))
    }
}

// ── Result rows ──────────────────────────────────────────────────

/// Answer row of an admission-like statement.
struct Outcome {
    outcome: String,
    reason: Option<String>,
    message: String,
    booking: Option<Booking>,
    raised_to: Option<u32>,
    conflict: Option<Occurrence>,
}

impl Outcome {
    fn admitted(booking: &Booking, raised_to: Option<u32>) -> Self {
        Self {
            outcome: booking.status.as_str().to_string(),
            reason: None,
            message: "booked".into(),
            booking: Some(booking.clone()),
            raised_to,
            conflict: None,
        }
    }

    fn rejected(rejection: &Rejection) -> Self {
        let conflict = rejection.conflict().map(|c| c.existing.clone());
        Self {
            outcome: if conflict.is_some() { "conflict" } else { "rejected" }.to_string(),
            reason: Some(rejection.code().to_string()),
            message: rejection.to_string(),
            booking: None,
            raised_to: None,
            conflict,
        }
    }

    /// Rejections become rows; internal faults stay errors.
    fn refused(e: EngineError) -> PgWireResult<Self> {
        match e.rejection() {
            Some(rejection) => {
                debug!(code = rejection.code(), "admission refused: {rejection}");
                Ok(Self::rejected(rejection))
            }
            None => Err(engine_err(e)),
        }
    }

    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()> {
        let b = self.booking.as_ref();
        encoder.encode_field(&self.outcome)?;
        encoder.encode_field(&self.reason)?;
        encoder.encode_field(&self.message)?;
        encoder.encode_field(&b.map(|b| b.id.to_string()))?;
        encoder.encode_field(&b.map(|b| b.unit_id.to_string()))?;
        encoder.encode_field(&b.map(|b| b.date.to_string()))?;
        encoder.encode_field(&b.map(|b| b.holder.clone()))?;
        encoder.encode_field(&b.map(|b| b.status.as_str().to_string()))?;
        encoder.encode_field(&b.and_then(|b| b.token.clone()))?;
        encoder.encode_field(&self.raised_to.map(i64::from))?;
        let c = self.conflict.as_ref();
        encoder.encode_field(&c.and_then(|c| c.booking_id).map(|id| id.to_string()))?;
        encoder.encode_field(&c.map(|c| c.unit_id.to_string()))?;
        encoder.encode_field(&c.map(|c| c.unit_name.clone()))?;
        encoder.encode_field(&c.map(|c| c.date.to_string()))?;
        Ok(())
    }
}

struct SeriesRow {
    series_id: String,
    date: chrono::NaiveDate,
    outcome: Outcome,
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn outcome_schema() -> Vec<FieldInfo> {
    vec![
        field("outcome", Type::VARCHAR),
        field("reason", Type::VARCHAR),
        field("message", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("holder", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("token", Type::VARCHAR),
        field("raised_to", Type::INT8),
        field("conflict_booking_id", Type::VARCHAR),
        field("conflict_unit_id", Type::VARCHAR),
        field("conflict_unit", Type::VARCHAR),
        field("conflict_date", Type::VARCHAR),
    ]
}

fn series_outcome_schema() -> Vec<FieldInfo> {
    let mut schema = vec![field("series_id", Type::VARCHAR), field("occurrence", Type::VARCHAR)];
    schema.extend(outcome_schema());
    schema
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("holder", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("note", Type::VARCHAR),
        field("token", Type::VARCHAR),
        field("series_id", Type::VARCHAR),
        field("reason", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("unit_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("category", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("booked", Type::INT8),
        field("available", Type::INT8),
        field("status", Type::VARCHAR),
        field("reason", Type::VARCHAR),
    ]
}

fn day_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("open", Type::BOOL),
        field("reason", Type::VARCHAR),
    ]
}

fn units_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("category", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("active", Type::BOOL),
    ]
}

fn series_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("holder", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("pattern", Type::VARCHAR),
        field("weekdays", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

fn overrides_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("weekday", Type::VARCHAR),
        field("week", Type::INT8),
        field("reason", Type::VARCHAR),
    ]
}

fn roles_schema() -> Vec<FieldInfo> {
    vec![field("holder", Type::VARCHAR), field("role", Type::VARCHAR)]
}

fn schema_for(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Tag => vec![],
        ResultShape::Outcome => outcome_schema(),
        ResultShape::SeriesOutcome => series_outcome_schema(),
        ResultShape::Bookings => bookings_schema(),
        ResultShape::Availability => availability_schema(),
        ResultShape::Day => day_schema(),
        ResultShape::Units => units_schema(),
        ResultShape::Series => series_schema(),
        ResultShape::Overrides => overrides_schema(),
        ResultShape::Roles => roles_schema(),
    }
}

fn time_text(t: chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn outcome_response(row: Outcome) -> Response {
    query_response(outcome_schema(), [row], |encoder, row| row.encode(encoder))
}

fn series_outcome_response(rows: Vec<SeriesRow>) -> Response {
    query_response(series_outcome_schema(), rows, |encoder, row| {
        encoder.encode_field(&row.series_id)?;
        encoder.encode_field(&row.date.to_string())?;
        row.outcome.encode(encoder)
    })
}

fn bookings_response(rows: Vec<Booking>) -> Response {
    query_response(bookings_schema(), rows, |encoder, b| {
        encoder.encode_field(&b.id.to_string())?;
        encoder.encode_field(&b.unit_id.to_string())?;
        encoder.encode_field(&b.holder)?;
        encoder.encode_field(&b.date.to_string())?;
        encoder.encode_field(&b.status.as_str().to_string())?;
        encoder.encode_field(&b.note)?;
        encoder.encode_field(&b.token)?;
        encoder.encode_field(&b.series_id.map(|s| s.to_string()))?;
        encoder.encode_field(&b.reason)?;
        Ok(())
    })
}

fn availability_response(slots: Vec<SlotAvailability>) -> Response {
    query_response(availability_schema(), slots, |encoder, s| {
        encoder.encode_field(&s.unit_id.to_string())?;
        encoder.encode_field(&s.name)?;
        encoder.encode_field(&s.category)?;
        encoder.encode_field(&time_text(s.window.start))?;
        encoder.encode_field(&time_text(s.window.end))?;
        encoder.encode_field(&i64::from(s.capacity))?;
        encoder.encode_field(&i64::from(s.booked))?;
        encoder.encode_field(&i64::from(s.available))?;
        encoder.encode_field(&s.status.map(|st| st.as_str().to_string()))?;
        encoder.encode_field(&s.reason)?;
        Ok(())
    })
}

fn day_response(date: chrono::NaiveDate, status: DayStatus) -> Response {
    query_response(day_schema(), [status], |encoder, status| {
        encoder.encode_field(&date.to_string())?;
        encoder.encode_field(&status.is_open())?;
        encoder.encode_field(&(!status.is_open()).then(|| status.reason()))?;
        Ok(())
    })
}

fn units_response(units: Vec<UnitInfo>) -> Response {
    query_response(units_schema(), units, |encoder, u| {
        encoder.encode_field(&u.id.to_string())?;
        encoder.encode_field(&u.name)?;
        encoder.encode_field(&u.category)?;
        encoder.encode_field(&time_text(u.window.start))?;
        encoder.encode_field(&time_text(u.window.end))?;
        encoder.encode_field(&i64::from(u.capacity))?;
        encoder.encode_field(&u.active)?;
        Ok(())
    })
}

fn series_response(rows: Vec<Series>) -> Response {
    query_response(series_schema(), rows, |encoder, s| {
        let weekdays = match &s.pattern {
            Pattern::Daily => None,
            Pattern::Weekly(days) => Some(
                days.iter()
                    .map(|d| d.to_string().to_lowercase())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        };
        encoder.encode_field(&s.id.to_string())?;
        encoder.encode_field(&s.holder)?;
        encoder.encode_field(&s.unit_id.to_string())?;
        encoder.encode_field(&s.start.to_string())?;
        encoder.encode_field(&s.end.to_string())?;
        encoder.encode_field(&s.pattern.label().to_string())?;
        encoder.encode_field(&weekdays)?;
        encoder.encode_field(&s.active)?;
        Ok(())
    })
}

fn overrides_response(rows: Vec<(ulid::Ulid, Override)>) -> Response {
    query_response(overrides_schema(), rows, |encoder, (id, rule)| {
        let (date, weekday, week) = match &rule {
            Override::Block { date, .. } | Override::Holiday { date, .. } => (Some(date.to_string()), None, None),
            Override::RecurringBlock { weekday, week, .. } => {
                (None, Some(weekday.to_string().to_lowercase()), Some(i64::from(*week)))
            }
            Override::Break { weekday, .. } => (None, Some(weekday.to_string().to_lowercase()), None),
        };
        encoder.encode_field(&id.to_string())?;
        encoder.encode_field(&rule.kind().to_string())?;
        encoder.encode_field(&rule.unit_id().map(|u| u.to_string()))?;
        encoder.encode_field(&date)?;
        encoder.encode_field(&weekday)?;
        encoder.encode_field(&week)?;
        encoder.encode_field(&rule.reason().to_string())?;
        Ok(())
    })
}

fn roles_response(holder: &str, roles: Vec<String>) -> Response {
    query_response(roles_schema(), roles, |encoder, role| {
        encoder.encode_field(&holder.to_string())?;
        encoder.encode_field(&role)?;
        Ok(())
    })
}

#[async_trait]
impl SimpleQueryHandler for LarderHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (org, actor) = self.resolve_session(client)?;
        Ok(vec![self.run(&org, &actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LarderQueryParser;

#[async_trait]
impl QueryParser for LarderQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(sql::result_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LarderHandler {
    type Statement = String;
    type QueryParser = LarderQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (org, actor) = self.resolve_session(client)?;
        let sql = substitute_params(portal);
        self.run(&org, &actor, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let schema = schema_for(sql::result_shape(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, schema))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let schema = schema_for(sql::result_shape(&target.statement.statement));
        Ok(DescribePortalResponse::new(schema))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as (byte range, N).
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote inside a literal is an escaped quote; the second
            // one reopens the literal on the next iteration.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// One left-to-right pass; inserted values are never scanned again.
/// Placeholders without a bound value are left as written.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (span, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..span.start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = span.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LarderFactory {
    handler: Arc<LarderHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LarderAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LarderFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, access: Access) -> Self {
        let auth_source = LarderAuthSource::new(access.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LarderHandler::new(tenant_manager, access)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LarderFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    access: Access,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(LarderFactory::new(tenant_manager, access));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    let (code, message) = match &e {
        EngineError::Rejected(r) => ("P0001", format!("{}: {r}", r.code())),
        EngineError::WalError(_) => {
            error!("internal fault: {e}");
            ("XX000", e.to_string())
        }
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
