use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use ulid::Ulid;

use crate::auth::HostbookAuthSource;
use crate::engine::{now_ms, CaptureOutcome, Compensation, Engine, EngineError, WebhookOutcome};
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError, LISTEN_CHANNEL_PREFIX};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(HostbookFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Per-connection query handler. Holds the connection's LISTEN subscriptions.
pub struct HostbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<HostbookQueryParser>,
    listeners: Mutex<Vec<(Ulid, broadcast::Receiver<Notification>)>>,
}

impl HostbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(HostbookQueryParser),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Execute with query metrics, then deliver any queued notifications.
    async fn run<C>(&self, client: &mut C, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        for message in self.pending_notifications() {
            client.send(message).await?;
        }
        result
    }

    fn pending_notifications(&self) -> Vec<PgWireBackendMessage> {
        let Ok(mut listeners) = self.listeners.lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        listeners.retain_mut(|(user_id, rx)| loop {
            match rx.try_recv() {
                Ok(n) => out.push(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    0,
                    format!("{LISTEN_CHANNEL_PREFIX}{user_id}"),
                    n.to_payload(),
                ))),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("listener for {user_id} dropped {skipped} notifications");
                }
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Closed) => break false,
            }
        });
        out
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let now = now_ms();
        let response = match cmd {
            Command::UpsertHost {
                id,
                email,
                payout_account,
            } => {
                engine.upsert_host(id, email, payout_account).await.map_err(engine_err)?;
                inserted()
            }
            Command::UpsertCustomer { id, email, name } => {
                engine.upsert_customer(id, email, name).await.map_err(engine_err)?;
                inserted()
            }
            Command::CreatePayoutAccount { host_id, country } => {
                let account = engine
                    .create_payout_account(host_id, &country)
                    .await
                    .map_err(engine_err)?;
                query_response(payout_schema(), [(host_id, account)], |enc, (host_id, account)| {
                    enc.encode_field(&host_id.to_string())?;
                    enc.encode_field(&account)
                })
            }
            Command::InsertAvailability {
                id,
                host_id,
                start,
                end,
                recurrence,
            } => {
                engine
                    .create_availability(id, host_id, client_span(start, end), recurrence, now)
                    .await
                    .map_err(engine_err)?;
                inserted()
            }
            Command::RetireAvailability { id } => {
                engine.retire_availability(id).await.map_err(engine_err)?;
                Response::Execution(Tag::new("DELETE").with_rows(1))
            }
            Command::InsertReservation {
                id,
                customer_id,
                host_id,
                start,
                end,
                amount,
            } => {
                let r = engine
                    .create_reservation(id, customer_id, host_id, client_span(start, end), amount, now)
                    .await
                    .map_err(engine_err)?;
                reservation_rows([r])
            }
            Command::ConfirmReservation { reservation_id } => {
                let r = engine
                    .confirm_reservation(reservation_id, now)
                    .await
                    .map_err(engine_err)?;
                reservation_rows([r])
            }
            Command::CancelReservation {
                reservation_id,
                actor_id,
                reason,
            } => {
                let changed = engine
                    .cancel_reservation(reservation_id, actor_id, reason, now)
                    .await
                    .map_err(engine_err)?;
                reservation_change_rows(changed)
            }
            Command::RescheduleReservation {
                reservation_id,
                actor_id,
                new_id,
                start,
                end,
            } => {
                let r = engine
                    .reschedule_reservation(reservation_id, actor_id, new_id, client_span(start, end), now)
                    .await
                    .map_err(engine_err)?;
                reservation_rows([r])
            }
            Command::CompleteReservation { reservation_id } => {
                let r = engine
                    .complete_reservation(reservation_id, now)
                    .await
                    .map_err(engine_err)?;
                reservation_rows([r])
            }
            Command::MarkNoShow { reservation_id } => {
                let r = engine.mark_no_show(reservation_id, now).await.map_err(engine_err)?;
                reservation_rows([r])
            }
            Command::OverrideStatus {
                reservation_id,
                status,
                note,
            } => {
                let changed = engine
                    .override_status(reservation_id, status, note, now)
                    .await
                    .map_err(engine_err)?;
                reservation_change_rows(changed)
            }
            Command::InsertPayment {
                id,
                customer_id,
                host_id,
                amount,
                reservation_id,
                description,
            } => {
                let receipt = engine
                    .create_payment_intent(id, customer_id, host_id, amount, reservation_id, description, now)
                    .await
                    .map_err(engine_err)?;
                query_response(receipt_schema(), [receipt], |enc, receipt| {
                    enc.encode_field(&receipt.transaction_id.to_string())?;
                    enc.encode_field(&receipt.client_secret)
                })
            }
            Command::CapturePayment { intent_ref } => {
                let outcome = engine.capture_payment(&intent_ref, now).await.map_err(engine_err)?;
                query_response(capture_schema(), [outcome], encode_capture)
            }
            Command::RefundTransaction {
                transaction_id,
                reason,
            } => {
                let entry = engine
                    .refund_transaction(transaction_id, reason)
                    .await
                    .map_err(engine_err)?;
                transaction_rows([entry])
            }
            Command::RunSettlement { at } => {
                let released = engine
                    .process_releases(at.unwrap_or(now))
                    .await
                    .map_err(engine_err)?;
                transaction_rows(released)
            }
            Command::Webhook { payload, signature } => {
                let outcome = engine
                    .handle_webhook(payload.as_bytes(), &signature, now)
                    .await
                    .map_err(engine_err)?;
                query_response(webhook_schema(), [outcome], encode_webhook)
            }
            Command::SelectAvailability { host_id, start, end } => {
                let slots = engine
                    .expand_availability(host_id, client_span(start, end))
                    .await
                    .map_err(engine_err)?;
                query_response(occurrence_schema(), slots, |enc, occ| {
                    enc.encode_field(&host_id.to_string())?;
                    enc.encode_field(&occ.availability_id.to_string())?;
                    enc.encode_field(&occ.span.start)?;
                    enc.encode_field(&occ.span.end)
                })
            }
            Command::SelectSlot { host_id, start, end } => {
                let free = engine
                    .is_host_free(host_id, client_span(start, end))
                    .await
                    .map_err(engine_err)?;
                query_response(slot_schema(), [free], |enc, free| {
                    enc.encode_field(&host_id.to_string())?;
                    enc.encode_field(&start)?;
                    enc.encode_field(&end)?;
                    enc.encode_field(&free)
                })
            }
            Command::SelectReservations { filter } => reservation_rows(engine.list_reservations(filter, now).await),
            Command::SelectTransactions { filter } => transaction_rows(engine.list_transactions(filter).await),
            Command::SelectTransactionStats => {
                let stats = engine.transaction_stats().await;
                query_response(stats_schema(), [stats], |enc, stats| {
                    enc.encode_field(&i64::try_from(stats.completed_count).unwrap_or(i64::MAX))?;
                    enc.encode_field(&stats.total_amount.to_string())?;
                    enc.encode_field(&stats.total_commission.to_string())?;
                    enc.encode_field(&stats.total_vat.to_string())?;
                    enc.encode_field(&stats.total_revenue.to_string())
                })
            }
            Command::SelectCallToken {
                reservation_id,
                user_id,
            } => {
                let grant = engine
                    .join_call(reservation_id, user_id, now)
                    .await
                    .map_err(engine_err)?;
                query_response(call_token_schema(), [grant], |enc, grant| {
                    enc.encode_field(&grant.token)?;
                    enc.encode_field(&grant.channel)?;
                    enc.encode_field(&i64::from(grant.uid))?;
                    enc.encode_field(&grant.role.to_string())?;
                    enc.encode_field(&grant.expires_at)
                })
            }
            Command::Listen { user_id } => {
                let rx = engine.services().notifier.listen(user_id).ok_or_else(|| {
                    user_error("0A000", "notifications are not available for this tenant".into())
                })?;
                if let Ok(mut listeners) = self.listeners.lock() {
                    listeners.push((user_id, rx));
                }
                Response::Execution(Tag::new("LISTEN"))
            }
        };
        Ok(vec![response])
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
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

fn reservation_rows(items: impl IntoIterator<Item = Reservation>) -> Response {
    query_response(reservation_schema(), items, |enc, r| encode_reservation(enc, &r))
}

fn reservation_change_rows((r, compensation): (Reservation, Compensation)) -> Response {
    let mut schema = reservation_schema();
    schema.push(field("compensation", Type::VARCHAR));
    query_response(schema, [(r, compensation)], |enc, (r, compensation)| {
        encode_reservation(enc, &r)?;
        enc.encode_field(&compensation.label())
    })
}

fn transaction_rows(items: impl IntoIterator<Item = EscrowEntry>) -> Response {
    query_response(transaction_schema(), items, |enc, e| encode_transaction(enc, &e))
}

fn opt_id(id: Option<Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn encode_reservation(enc: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.customer_id.to_string())?;
    enc.encode_field(&r.host_id.to_string())?;
    enc.encode_field(&r.span.start)?;
    enc.encode_field(&r.span.end)?;
    enc.encode_field(&r.status.label())?;
    enc.encode_field(&r.amount.to_string())?;
    enc.encode_field(&opt_id(r.transaction_id))?;
    enc.encode_field(&r.cancellation_reason)?;
    enc.encode_field(&r.notes)?;
    enc.encode_field(&r.is_rescheduled)?;
    enc.encode_field(&opt_id(r.original_reservation_id))?;
    enc.encode_field(&r.created_at)
}

fn encode_transaction(enc: &mut DataRowEncoder, e: &EscrowEntry) -> PgWireResult<()> {
    enc.encode_field(&e.id.to_string())?;
    enc.encode_field(&e.kind.label())?;
    enc.encode_field(&e.customer_id.to_string())?;
    enc.encode_field(&e.host_id.to_string())?;
    enc.encode_field(&opt_id(e.reservation_id))?;
    enc.encode_field(&e.amount.to_string())?;
    enc.encode_field(&e.commission.to_string())?;
    enc.encode_field(&e.vat.to_string())?;
    enc.encode_field(&e.net.to_string())?;
    enc.encode_field(&e.currency)?;
    enc.encode_field(&e.status.label())?;
    enc.encode_field(&e.intent_ref)?;
    enc.encode_field(&e.charge_ref)?;
    enc.encode_field(&e.is_released)?;
    enc.encode_field(&e.released_at)?;
    enc.encode_field(&e.notes)?;
    enc.encode_field(&e.created_at)
}

fn encode_capture(enc: &mut DataRowEncoder, outcome: CaptureOutcome) -> PgWireResult<()> {
    enc.encode_field(&outcome.entry.id.to_string())?;
    enc.encode_field(&outcome.entry.status.label())?;
    enc.encode_field(&opt_id(outcome.reservation.as_ref().map(|r| r.id)))?;
    enc.encode_field(&outcome.reservation.as_ref().map(|r| r.status.label()))?;
    enc.encode_field(&outcome.compensation.label())?;
    enc.encode_field(&outcome.duplicate)
}

fn encode_webhook(enc: &mut DataRowEncoder, outcome: WebhookOutcome) -> PgWireResult<()> {
    let (label, entry, compensation): (String, Option<&EscrowEntry>, Option<&str>) = match &outcome {
        WebhookOutcome::Captured(capture) => ("captured".into(), Some(&capture.entry), Some(capture.compensation.label())),
        WebhookOutcome::Failed(entry) => ("failed".into(), Some(entry), None),
        WebhookOutcome::Ignored(kind) => (format!("ignored {kind}"), None, None),
    };
    enc.encode_field(&label)?;
    enc.encode_field(&entry.map(|e| e.id.to_string()))?;
    enc.encode_field(&entry.map(|e| e.status.label()))?;
    enc.encode_field(&compensation)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("host_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("amount", Type::VARCHAR),
        field("transaction_id", Type::VARCHAR),
        field("cancellation_reason", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("is_rescheduled", Type::BOOL),
        field("original_reservation_id", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn transaction_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("host_id", Type::VARCHAR),
        field("reservation_id", Type::VARCHAR),
        field("amount", Type::VARCHAR),
        field("commission", Type::VARCHAR),
        field("vat", Type::VARCHAR),
        field("net", Type::VARCHAR),
        field("currency", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("intent_ref", Type::VARCHAR),
        field("charge_ref", Type::VARCHAR),
        field("is_released", Type::BOOL),
        field("released_at", Type::INT8),
        field("notes", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn occurrence_schema() -> Vec<FieldInfo> {
    vec![
        field("host_id", Type::VARCHAR),
        field("availability_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("host_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("free", Type::BOOL),
    ]
}

fn payout_schema() -> Vec<FieldInfo> {
    vec![field("host_id", Type::VARCHAR), field("payout_account", Type::VARCHAR)]
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![field("transaction_id", Type::VARCHAR), field("client_secret", Type::VARCHAR)]
}

fn capture_schema() -> Vec<FieldInfo> {
    vec![
        field("transaction_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("reservation_id", Type::VARCHAR),
        field("reservation_status", Type::VARCHAR),
        field("compensation", Type::VARCHAR),
        field("duplicate", Type::BOOL),
    ]
}

fn webhook_schema() -> Vec<FieldInfo> {
    vec![
        field("outcome", Type::VARCHAR),
        field("transaction_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("compensation", Type::VARCHAR),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        field("completed_count", Type::INT8),
        field("total_amount", Type::VARCHAR),
        field("total_commission", Type::VARCHAR),
        field("total_vat", Type::VARCHAR),
        field("total_revenue", Type::VARCHAR),
    ]
}

fn call_token_schema() -> Vec<FieldInfo> {
    vec![
        field("token", Type::VARCHAR),
        field("channel", Type::VARCHAR),
        field("uid", Type::INT8),
        field("role", Type::VARCHAR),
        field("expires_at", Type::INT8),
    ]
}

/// Result columns for a statement, known from its target table alone.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let Some(table) = sql::result_table(sql) else {
        return vec![];
    };
    match table.as_str() {
        "reservations" | "confirmations" | "reschedules" | "completions" | "no_shows" => reservation_schema(),
        "cancellations" | "status_overrides" => {
            let mut schema = reservation_schema();
            schema.push(field("compensation", Type::VARCHAR));
            schema
        }
        "transactions" | "refunds" | "settlement_runs" => transaction_schema(),
        "payout_accounts" => payout_schema(),
        "payments" => receipt_schema(),
        "captures" => capture_schema(),
        "webhooks" => webhook_schema(),
        "availability" => occurrence_schema(),
        "slots" => slot_schema(),
        "transaction_stats" => stats_schema(),
        "call_tokens" => call_token_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for HostbookHandler {
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
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(client, &engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct HostbookQueryParser;

#[async_trait]
impl QueryParser for HostbookQueryParser {
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
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for HostbookHandler {
    type Statement = String;
    type QueryParser = HostbookQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(client, &engine, cmd)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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
            schema_for_sql(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_sql(&target.statement.statement)))
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
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct HostbookFactory {
    handler: Arc<HostbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<HostbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl HostbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = HostbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(HostbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for HostbookFactory {
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

/// Span taken verbatim from a statement. The engine validates it, so a
/// reversed or empty interval comes back as 22023 rather than a panic.
fn client_span(start: Ms, end: Ms) -> Span {
    Span { start, end }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
