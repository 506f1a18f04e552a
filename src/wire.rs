use std::fmt::Debug;
use std::io;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::accounts::AccountError;
use crate::auth::EnrolldAuthSource;
use crate::engine::{DropOutcome, EngineError, EnrollOutcome, ErrorKind};
use crate::model::Course;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::store::StoreError;
use crate::tenant::{Tenant, TenantManager};

pub struct EnrolldHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<EnrolldQueryParser>,
}

impl EnrolldHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(EnrolldQueryParser),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Tenant>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, execute and record metrics for one statement.
    async fn run<C: ClientInfo + Sync>(
        &self,
        client: &C,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        let tenant = self.resolve_tenant(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(&tenant, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        tenant: &Tenant,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertCourse { spec } => {
                tenant.ledger.create_course(spec).await.map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectCourses { id } => {
                let courses = match id {
                    Some(id) => tenant.ledger.course(&id).await.into_iter().collect(),
                    None => tenant.ledger.list_courses().await,
                };
                let schema = Arc::new(course_schema(format));
                let rows: Vec<PgWireResult<_>> = courses
                    .iter()
                    .map(|course| encode_course(&schema, course))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertStudent {
                id,
                name,
                email,
                password,
            } => {
                tenant
                    .accounts
                    .register(&id, &name, &email, &password)
                    .await
                    .map_err(account_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::Login { email, password } => {
                let token = tenant.accounts.login(&email, &password).await.map_err(account_err)?;
                let schema = Arc::new(session_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&token)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Logout { token } => {
                tenant.accounts.logout(&token).await.map_err(account_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectProfile { token } => {
                let student_id = tenant.accounts.authenticate(&token).map_err(account_err)?;
                let profile = tenant.accounts.profile(&student_id).await.map_err(account_err)?;
                let schema = Arc::new(profile_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&profile.id)?;
                encoder.encode_field(&profile.name)?;
                encoder.encode_field(&profile.email)?;
                encoder.encode_field(&profile.occupied.join(","))?;
                encoder.encode_field(&profile.waiting.join(","))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Enroll { token, course_id } => {
                let student_id = tenant.accounts.authenticate(&token).map_err(account_err)?;
                let tag = match tenant.engine.enroll(&student_id, &course_id).await.map_err(engine_err)? {
                    EnrollOutcome::Enrolled => Tag::new("ENROLL").with_rows(1),
                    EnrollOutcome::Waitlisted { position } => Tag::new("WAITLIST").with_rows(position),
                };
                Ok(vec![Response::Execution(tag)])
            }
            Command::Drop { token, course_id } => {
                let student_id = tenant.accounts.authenticate(&token).map_err(account_err)?;
                let tag = match tenant.engine.drop_course(&student_id, &course_id).await.map_err(engine_err)? {
                    DropOutcome::Dropped { .. } => Tag::new("DROP").with_rows(1),
                    DropOutcome::OptedOut => Tag::new("OPT OUT").with_rows(1),
                };
                Ok(vec![Response::Execution(tag)])
            }
        }
    }
}

fn encode_course(schema: &Arc<Vec<FieldInfo>>, course: &Course) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&course.spec.id)?;
    encoder.encode_field(&course.spec.name)?;
    encoder.encode_field(&(course.capacity() as i64))?;
    encoder.encode_field(&(course.occupancy as i64))?;
    encoder.encode_field(&(course.remaining() as i64))?;
    encoder.encode_field(&(course.waiters.len() as i64))?;
    encoder.encode_field(&course.spec.start_date.map(|d| d.to_string()))?;
    encoder.encode_field(&course.spec.end_date.map(|d| d.to_string()))?;
    encoder.encode_field(&course.spec.enroll_by.map(|d| d.to_string()))?;
    Ok(encoder.take_row())
}

const COURSE_FIELDS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("capacity", Type::INT8),
    ("occupancy", Type::INT8),
    ("remaining", Type::INT8),
    ("waitlist", Type::INT8),
    ("start_date", Type::VARCHAR),
    ("end_date", Type::VARCHAR),
    ("enroll_by", Type::VARCHAR),
];

const SESSION_FIELDS: &[(&str, Type)] = &[("token", Type::VARCHAR)];

const PROFILE_FIELDS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("email", Type::VARCHAR),
    ("enrolled", Type::VARCHAR),
    ("waitlisted", Type::VARCHAR),
];

fn schema(fields: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    fields
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(idx))
        })
        .collect()
}

fn course_schema(format: &Format) -> Vec<FieldInfo> {
    schema(COURSE_FIELDS, format)
}

fn session_schema(format: &Format) -> Vec<FieldInfo> {
    schema(SESSION_FIELDS, format)
}

fn profile_schema(format: &Format) -> Vec<FieldInfo> {
    schema(PROFILE_FIELDS, format)
}

/// Row description for a statement, chosen from its text before it is executed.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("COURSES") {
        course_schema(format)
    } else if upper.contains("SESSIONS") {
        session_schema(format)
    } else if upper.contains("STUDENTS") {
        profile_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for EnrolldHandler {
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
        self.run(client, query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct EnrolldQueryParser;

#[async_trait]
impl QueryParser for EnrolldQueryParser {
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
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for EnrolldHandler {
    type Statement = String;
    type QueryParser = EnrolldQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql, &portal.result_column_format).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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

/// Byte ranges and indexes of `$N` placeholders outside quoted literals and identifiers.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves the state unchanged.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start
                    && let Ok(n) = sql[start..end].parse::<usize>()
                {
                    found.push((i..end, n));
                }
                i = end;
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

/// Inline bound parameters (text format) as quoted literals in one left-to-right pass.
/// Inserted values are never scanned again, so a `$1` inside a value stays literal text.
/// Placeholders without a bound value are left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[last..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct EnrolldFactory {
    handler: Arc<EnrolldHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<EnrolldAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl EnrolldFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = EnrolldAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(EnrolldHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for EnrolldFactory {
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(EnrolldFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::Store(inner) => return store_err_ref(inner, e.to_string()),
        _ => match e.kind() {
            ErrorKind::NotFound => "P0002",
            _ => "P0001",
        },
    };
    user_error(code, e.to_string())
}

fn store_err_ref(e: &StoreError, message: String) -> PgWireError {
    let code = match e {
        StoreError::CourseNotFound(_) => "P0002",
        StoreError::AlreadyExists(_) => "23505",
        StoreError::Invalid(_) | StoreError::LimitExceeded(_) => "P0001",
        StoreError::Wal(_) | StoreError::Io(_) => "58030",
    };
    user_error(code, message)
}

fn store_err(e: StoreError) -> PgWireError {
    let message = e.to_string();
    store_err_ref(&e, message)
}

fn account_err(e: AccountError) -> PgWireError {
    let code = match &e {
        AccountError::InvalidCredentials | AccountError::InvalidSession => "28000",
        AccountError::DuplicateId(_) | AccountError::DuplicateEmail(_) => "23505",
        AccountError::StudentNotFound(_) => "P0002",
        AccountError::Invalid(_) => "P0001",
        AccountError::Hashing(_) => "XX000",
        AccountError::Store(inner) => return store_err_ref(inner, e.to_string()),
    };
    user_error(code, e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
