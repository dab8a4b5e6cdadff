use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use chrono_tz::Tz;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;

use crate::auth::ChairbookAuthSource;
use crate::booking::{BookingError, BookingRequest, BookingService};
use crate::directory::{DirectoryError, TenantClaim};
use crate::engine::{DensityRow, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

pub struct ChairbookHandler {
    booking: Arc<BookingService>,
    query_parser: Arc<ChairbookQueryParser>,
}

/// The connection's database name is the tenant subdomain.
fn database<C: ClientInfo>(client: &C) -> String {
    client
        .metadata()
        .get("database")
        .cloned()
        .unwrap_or_default()
}

impl ChairbookHandler {
    pub fn new(booking: Arc<BookingService>) -> Self {
        Self {
            booking,
            query_parser: Arc::new(ChairbookQueryParser),
        }
    }

    async fn run(&self, db: &str, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(db, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        tracing::debug!(tenant = db, command = label, status, "query");
        result
    }

    async fn execute_command(
        &self,
        db: &str,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let directory = self.booking.tenants().directory();
        match cmd {
            Command::InsertTenant {
                id,
                name,
                subdomain,
                timezone,
                slot_step_minutes,
                returning,
            } => {
                let tenant = directory
                    .claim(TenantClaim {
                        id,
                        name,
                        subdomain,
                        timezone,
                        slot_step_minutes,
                    })
                    .await
                    .map_err(directory_err)?;
                if returning {
                    Ok(tenant_rows(&[tenant], format))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateTenant { id, patch } => {
                directory.update_profile(id, patch).await.map_err(directory_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectTenants { subdomain } => {
                let tenants = match subdomain {
                    Some(slug) => match directory.resolve(&slug) {
                        Ok(tenant) => vec![tenant],
                        Err(DirectoryError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(directory_err(e)),
                    },
                    None => directory.list(),
                };
                Ok(tenant_rows(&tenants, format))
            }
            cmd => self.execute_tenant_command(db, cmd, format).await,
        }
    }

    /// Statements scoped to the tenant named by the connection's database.
    async fn execute_tenant_command(
        &self,
        db: &str,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let (tenant, engine) = self
            .booking
            .tenants()
            .resolve(db)
            .map_err(directory_err)?;

        match cmd {
            Command::InsertService {
                id,
                name,
                duration_minutes,
                price_cents,
            } => {
                engine
                    .upsert_service(Service {
                        id,
                        name,
                        duration_minutes,
                        price_cents,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateService {
                id,
                name,
                duration_minutes,
                price_cents,
            } => {
                let mut service = engine
                    .get_service(&id)
                    .ok_or_else(|| engine_err(EngineError::NotFound(id)))?;
                if let Some(name) = name {
                    service.name = name;
                }
                if let Some(d) = duration_minutes {
                    service.duration_minutes = d;
                }
                if let Some(p) = price_cents {
                    service.price_cents = p;
                }
                engine.upsert_service(service).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteService { id } => {
                engine.remove_service(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectServices => Ok(rows(SERVICE_COLUMNS, format, &engine.list_services(), |enc, s| {
                enc.encode_field(&s.id.to_string())?;
                enc.encode_field(&s.name)?;
                enc.encode_field(&(s.duration_minutes as i32))?;
                enc.encode_field(&s.price_cents)
            })),

            Command::InsertStaff {
                id,
                name,
                title,
                photo_url,
            } => {
                engine
                    .create_staff(id, name, title, photo_url)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateStaff {
                id,
                name,
                title,
                photo_url,
            } => {
                let current = engine
                    .get_staff(&id)
                    .await
                    .ok_or_else(|| engine_err(EngineError::NotFound(id)))?;
                engine
                    .update_staff(
                        id,
                        name.unwrap_or(current.name),
                        title.unwrap_or(current.title),
                        photo_url.unwrap_or(current.photo_url),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteStaff { id } => {
                engine
                    .remove_staff(id, self.booking.now())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectStaff => {
                let staff = engine.list_staff().await;
                let rules: Vec<String> = staff
                    .iter()
                    .map(|m| serde_json::to_string(&m.availability))
                    .collect::<Result<_, _>>()
                    .map_err(|e| internal_err(e.to_string()))?;
                let items: Vec<_> = staff.iter().zip(rules.iter()).collect();
                Ok(rows(STAFF_COLUMNS, format, &items, |enc, (m, rules)| {
                    enc.encode_field(&m.id.to_string())?;
                    enc.encode_field(&m.name)?;
                    enc.encode_field(&m.title)?;
                    enc.encode_field(&m.photo_url)?;
                    enc.encode_field(*rules)
                }))
            }

            Command::InsertAvailability { staff_id, rule } => {
                engine
                    .set_availability(staff_id, rule)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAvailability { staff_id } => {
                let rules = engine.get_availability(staff_id).await.map_err(engine_err)?;
                let staff_id = staff_id.to_string();
                Ok(rows(AVAILABILITY_COLUMNS, format, &rules, |enc, r| {
                    enc.encode_field(&staff_id)?;
                    enc.encode_field(&r.day.to_string())?;
                    enc.encode_field(&r.is_working)?;
                    enc.encode_field(&r.start_time.format("%H:%M").to_string())?;
                    enc.encode_field(&r.end_time.format("%H:%M").to_string())
                }))
            }

            Command::InsertTimeOff { time_off } => {
                engine.add_time_off(time_off).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteTimeOff { id } => {
                engine.remove_time_off(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectTimeOff { staff_id } => {
                let entries = engine.get_time_off(staff_id).await.map_err(engine_err)?;
                Ok(rows(TIME_OFF_COLUMNS, format, &entries, |enc, t| {
                    enc.encode_field(&t.id.to_string())?;
                    enc.encode_field(&t.staff_id.to_string())?;
                    enc.encode_field(&t.start_date.to_string())?;
                    enc.encode_field(&t.end_date.to_string())?;
                    enc.encode_field(&t.start_time.map(|t| t.format("%H:%M").to_string()))?;
                    enc.encode_field(&t.end_time.map(|t| t.format("%H:%M").to_string()))?;
                    enc.encode_field(&t.reason)
                }))
            }

            Command::SelectSlots {
                staff_id,
                service_id,
                date,
            } => {
                let slots = self
                    .booking
                    .available_slots(db, staff_id, service_id, date)
                    .await
                    .map_err(booking_err)?;
                let (staff_id, service_id) = (staff_id.to_string(), service_id.to_string());
                let tz = tenant.timezone;
                Ok(rows(SLOT_COLUMNS, format, &slots, |enc, slot| {
                    enc.encode_field(&staff_id)?;
                    enc.encode_field(&service_id)?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)?;
                    enc.encode_field(&local_rfc3339(tz, slot.start))
                }))
            }

            Command::InsertBooking {
                id,
                service_id,
                staff_id,
                start,
                customer_name,
                customer_email,
                returning,
            } => {
                let booking = self
                    .booking
                    .book(BookingRequest {
                        tenant_slug: db.to_string(),
                        service_id,
                        staff_id,
                        booking_id: id,
                        start,
                        customer_name,
                        customer_email,
                    })
                    .await
                    .map_err(booking_err)?;
                if returning {
                    Ok(booking_rows(&[booking], format))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::DeleteBooking { id } => {
                self.booking.cancel(db, id).await.map_err(booking_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { staff_id } => {
                let bookings = engine.get_bookings(staff_id).await.map_err(engine_err)?;
                Ok(booking_rows(&bookings, format))
            }
            Command::SelectBookingDensity { from, to, staff_id } => {
                let density = engine
                    .booking_density(tenant.timezone, from, to, staff_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(DENSITY_COLUMNS, format, &density, |enc, row: &DensityRow| {
                    enc.encode_field(&row.date.to_string())?;
                    enc.encode_field(&(row.count as i64))
                }))
            }

            Command::InsertTenant { .. } | Command::UpdateTenant { .. } | Command::SelectTenants { .. } => {
                Err(internal_err("tenant statement routed to tenant scope".into()))
            }
        }
    }
}

fn local_rfc3339(tz: Tz, ms: Ms) -> Option<String> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.with_timezone(&tz).to_rfc3339())
}

// ── Result schemas ───────────────────────────────────────────────

type Columns = &'static [(&'static str, Type)];

const TENANT_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("subdomain", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("timezone", Type::VARCHAR),
    ("slot_step_minutes", Type::INT4),
    ("headline", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("address", Type::VARCHAR),
    ("logo_url", Type::VARCHAR),
];

const SERVICE_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("duration_minutes", Type::INT4),
    ("price_cents", Type::INT8),
];

const STAFF_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("title", Type::VARCHAR),
    ("photo_url", Type::VARCHAR),
    ("availability", Type::VARCHAR),
];

const AVAILABILITY_COLUMNS: Columns = &[
    ("staff_id", Type::VARCHAR),
    ("day", Type::VARCHAR),
    ("is_working", Type::BOOL),
    ("start_time", Type::VARCHAR),
    ("end_time", Type::VARCHAR),
];

const TIME_OFF_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("staff_id", Type::VARCHAR),
    ("start_date", Type::VARCHAR),
    ("end_date", Type::VARCHAR),
    ("start_time", Type::VARCHAR),
    ("end_time", Type::VARCHAR),
    ("reason", Type::VARCHAR),
];

const SLOT_COLUMNS: Columns = &[
    ("staff_id", Type::VARCHAR),
    ("service_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("local_start", Type::VARCHAR),
];

const BOOKING_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("staff_id", Type::VARCHAR),
    ("service_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("customer_name", Type::VARCHAR),
    ("customer_email", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("created_at", Type::INT8),
];

const DENSITY_COLUMNS: Columns = &[("date", Type::VARCHAR), ("count", Type::INT8)];

fn table_columns(table: &str) -> Option<Columns> {
    match table {
        "tenants" => Some(TENANT_COLUMNS),
        "services" => Some(SERVICE_COLUMNS),
        "staff" => Some(STAFF_COLUMNS),
        "availability" => Some(AVAILABILITY_COLUMNS),
        "time_off" => Some(TIME_OFF_COLUMNS),
        "slots" => Some(SLOT_COLUMNS),
        "bookings" => Some(BOOKING_COLUMNS),
        "booking_density" => Some(DENSITY_COLUMNS),
        _ => None,
    }
}

fn schema(columns: Columns, format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

/// Row description for a statement that may still contain `$N` placeholders.
/// Only SELECTs and `INSERT … RETURNING` produce rows.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let table = match words.first() {
        Some(&"select") => words.iter().skip_while(|w| **w != "from").nth(1),
        Some(&"insert") if words.contains(&"returning") => {
            words.iter().skip_while(|w| **w != "into").nth(1)
        }
        _ => None,
    };
    table
        .and_then(|t| table_columns(t))
        .map(|columns| schema(columns, format))
        .unwrap_or_default()
}

fn rows<T>(
    columns: Columns,
    format: &Format,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(columns, format));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn tenant_rows(tenants: &[Tenant], format: &Format) -> Response {
    rows(TENANT_COLUMNS, format, tenants, |enc, t| {
        enc.encode_field(&t.id.to_string())?;
        enc.encode_field(&t.subdomain)?;
        enc.encode_field(&t.name)?;
        enc.encode_field(&t.timezone.name().to_string())?;
        enc.encode_field(&t.slot_step_minutes.map(|m| m as i32))?;
        enc.encode_field(&t.headline)?;
        enc.encode_field(&t.description)?;
        enc.encode_field(&t.address)?;
        enc.encode_field(&t.logo_url)
    })
}

fn booking_rows(bookings: &[Booking], format: &Format) -> Response {
    rows(BOOKING_COLUMNS, format, bookings, |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.staff_id.to_string())?;
        enc.encode_field(&b.service_id.to_string())?;
        enc.encode_field(&b.span.start)?;
        enc.encode_field(&b.span.end)?;
        enc.encode_field(&b.customer_name)?;
        enc.encode_field(&b.customer_email)?;
        let status = if b.is_confirmed() { "confirmed" } else { "cancelled" };
        enc.encode_field(&status.to_string())?;
        enc.encode_field(&b.created_at)
    })
}

#[async_trait]
impl SimpleQueryHandler for ChairbookHandler {
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
        let db = database(client);
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(&db, cmd, &Format::UnifiedText).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChairbookQueryParser;

#[async_trait]
impl QueryParser for ChairbookQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ChairbookHandler {
    type Statement = String;
    type QueryParser = ChairbookQueryParser;

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
        let db = database(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&db, cmd, &portal.result_column_format).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement, &Format::UnifiedText),
        ))
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Values are always quoted; the parser accepts quoted numbers and booleans.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

fn substitute(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut copied = 0;
    let mut i = 0;
    // One pass, so text inside a bound value is never rescanned.
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let dollar = i;
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let param = sql[start..i]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            result.push_str(&sql[copied..dollar]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value);
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                None => result.push_str("NULL"),
            }
            copied = i;
        }
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, msg: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        msg,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::HasBookings(_) => "23503",
        EngineError::Invalid(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::WalError(_) => "58030",
    };
    user_error(code, e.to_string())
}

fn directory_err(e: DirectoryError) -> PgWireError {
    let code = match &e {
        DirectoryError::NotFound(_) => "P0002",
        DirectoryError::SubdomainTaken(_) | DirectoryError::AlreadyExists(_) => "23505",
        DirectoryError::Invalid(_) | DirectoryError::LimitExceeded(_) => "22023",
        DirectoryError::Storage(_) => "58030",
    };
    user_error(code, e.to_string())
}

fn booking_err(e: BookingError) -> PgWireError {
    let code = match &e {
        BookingError::NotFound(_) => "P0002",
        BookingError::SlotUnavailable => "23P01",
        BookingError::InvalidReference(_) => "23503",
        BookingError::Invalid(_) => "22023",
        BookingError::StorageFailure(_) => "58030",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

fn internal_err(msg: String) -> PgWireError {
    user_error("XX000", msg)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ChairbookFactory {
    handler: Arc<ChairbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ChairbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ChairbookFactory {
    pub fn new(booking: Arc<BookingService>, password: String) -> Self {
        let auth_source = ChairbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ChairbookHandler::new(booking)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChairbookFactory {
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
    booking: Arc<BookingService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ChairbookFactory::new(booking, password));
    process_socket(socket, tls, factory).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(fields: &[FieldInfo]) -> Vec<String> {
        fields.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM services"), 0);
        assert_eq!(
            count_params("INSERT INTO bookings VALUES ($1, $2, $3, $4, $5, $6)"),
            6
        );
        assert_eq!(count_params("SELECT * FROM slots WHERE date = $12"), 12);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let params = vec![
            Some(Bytes::from_static(b"O'Brien")),
            None,
            Some(Bytes::from_static(b"30")),
        ];
        let sql = substitute("VALUES ($1, $2, $3)", &params);
        assert_eq!(sql, "VALUES ('O''Brien', NULL, '30')");
    }

    #[test]
    fn substitute_does_not_clobber_two_digit_placeholders() {
        let params: Vec<_> = (1..=10)
            .map(|i| Some(Bytes::from(i.to_string())))
            .collect();
        let sql = substitute("($1, $10)", &params);
        assert_eq!(sql, "('1', '10')");
    }

    #[test]
    fn substitute_leaves_bound_text_alone() {
        let params = vec![
            Some(Bytes::from_static(b"Sam")),
            Some(Bytes::from_static(b"costs $1 or $2")),
        ];
        let sql = substitute("VALUES ($1, $2)", &params);
        assert_eq!(sql, "VALUES ('Sam', 'costs $1 or $2')");
    }

    #[test]
    fn substitute_keeps_unbound_placeholders() {
        let params = vec![Some(Bytes::from_static(b"x"))];
        assert_eq!(substitute("($1, $2, $0, $)", &params), "('x', $2, $0, $)");
    }

    #[test]
    fn result_schema_by_table() {
        let f = Format::UnifiedText;
        assert_eq!(
            names(&result_schema("SELECT * FROM slots WHERE date = $1", &f)),
            vec!["staff_id", "service_id", "start", "end", "local_start"]
        );
        assert_eq!(
            names(&result_schema("select * from booking_density where date >= $1", &f)),
            vec!["date", "count"]
        );
        assert_eq!(
            result_schema("INSERT INTO bookings VALUES ($1, $2, $3, $4, $5, $6) RETURNING *", &f)
                .len(),
            BOOKING_COLUMNS.len()
        );
        assert!(result_schema("INSERT INTO bookings VALUES ($1)", &f).is_empty());
        assert!(result_schema("DELETE FROM bookings WHERE id = $1", &f).is_empty());
    }

    #[test]
    fn local_start_in_tenant_zone() {
        // 2025-01-06T15:00:00Z is 10:00 in New York.
        let s = local_rfc3339(chrono_tz::America::New_York, 1_736_175_600_000).unwrap();
        assert_eq!(s, "2025-01-06T10:00:00-05:00");
    }
}
