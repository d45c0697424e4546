use std::str::FromStr;

use rust_decimal::Decimal;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{ReservationFilter, TransactionFilter};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertHost {
        id: Ulid,
        email: Option<String>,
        payout_account: Option<String>,
    },
    UpsertCustomer {
        id: Ulid,
        email: String,
        name: String,
    },
    CreatePayoutAccount {
        host_id: Ulid,
        country: String,
    },
    InsertAvailability {
        id: Ulid,
        host_id: Ulid,
        start: Ms,
        end: Ms,
        recurrence: Recurrence,
    },
    RetireAvailability {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        customer_id: Ulid,
        host_id: Ulid,
        start: Ms,
        end: Ms,
        amount: Decimal,
    },
    ConfirmReservation {
        reservation_id: Ulid,
    },
    CancelReservation {
        reservation_id: Ulid,
        actor_id: Ulid,
        reason: Option<String>,
    },
    RescheduleReservation {
        reservation_id: Ulid,
        actor_id: Ulid,
        new_id: Ulid,
        start: Ms,
        end: Ms,
    },
    CompleteReservation {
        reservation_id: Ulid,
    },
    MarkNoShow {
        reservation_id: Ulid,
    },
    OverrideStatus {
        reservation_id: Ulid,
        status: ReservationStatus,
        note: Option<String>,
    },
    InsertPayment {
        id: Ulid,
        customer_id: Ulid,
        host_id: Ulid,
        amount: Decimal,
        reservation_id: Option<Ulid>,
        description: Option<String>,
    },
    CapturePayment {
        intent_ref: String,
    },
    RefundTransaction {
        transaction_id: Ulid,
        reason: Option<String>,
    },
    /// `at` defaults to the current time.
    RunSettlement {
        at: Option<Ms>,
    },
    Webhook {
        payload: String,
        signature: String,
    },
    SelectAvailability {
        host_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectSlot {
        host_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectTransactions {
        filter: TransactionFilter,
    },
    SelectTransactionStats,
    SelectCallToken {
        reservation_id: Ulid,
        user_id: Ulid,
    },
    /// `LISTEN user_<id>`: stream that user's notifications to this session.
    Listen {
        user_id: Ulid,
    },
}

pub const LISTEN_CHANNEL_PREFIX: &str = "user_";

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(rest) = trimmed
        .get(..7)
        .filter(|head| head.eq_ignore_ascii_case("LISTEN "))
        .and_then(|_| trimmed.get(7..))
    {
        let channel = rest.trim().trim_matches(';').trim().trim_matches('"');
        let id = channel
            .strip_prefix(LISTEN_CHANNEL_PREFIX)
            .ok_or_else(|| SqlError::Parse(format!("invalid channel: {channel} (expected user_{{id}})")))?;
        let user_id = Ulid::from_string(id).map_err(|e| SqlError::Parse(format!("bad ULID in channel: {e}")))?;
        return Ok(Command::Listen { user_id });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table an INSERT or SELECT targets, read without binding any values.
/// Used to describe result columns before `$n` parameters are known.
pub fn result_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => insert_table_name(insert).ok(),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => select
                .from
                .first()
                .and_then(|from| table_factor_name(&from.relation).ok()),
            _ => None,
        },
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = |defaults: &[&str]| InsertRow::new(insert, defaults);

    match table.as_str() {
        "hosts" => {
            let r = row(&["id", "email", "payout_account"])?;
            Ok(Command::UpsertHost {
                id: r.ulid("id")?,
                email: r.opt_text("email")?,
                payout_account: r.opt_text("payout_account")?,
            })
        }
        "customers" => {
            let r = row(&["id", "email", "name"])?;
            Ok(Command::UpsertCustomer {
                id: r.ulid("id")?,
                email: r.text("email")?,
                name: r.opt_text("name")?.unwrap_or_default(),
            })
        }
        "payout_accounts" => {
            let r = row(&["host_id", "country"])?;
            Ok(Command::CreatePayoutAccount {
                host_id: r.ulid("host_id")?,
                country: r.opt_text("country")?.unwrap_or_else(|| "ES".into()),
            })
        }
        "availabilities" => {
            let r = row(&["id", "host_id", "start", "end", "recurrence", "days"])?;
            let kind = r.opt_text("recurrence")?.unwrap_or_else(|| "once".into());
            let days = r.opt_text("days")?;
            Ok(Command::InsertAvailability {
                id: r.ulid("id")?,
                host_id: r.ulid("host_id")?,
                start: r.i64("start")?,
                end: r.i64("end")?,
                recurrence: parse_recurrence(&kind, days.as_deref())?,
            })
        }
        "reservations" => {
            let r = row(&["id", "customer_id", "host_id", "start", "end", "amount"])?;
            Ok(Command::InsertReservation {
                id: r.ulid("id")?,
                customer_id: r.ulid("customer_id")?,
                host_id: r.ulid("host_id")?,
                start: r.i64("start")?,
                end: r.i64("end")?,
                amount: r.opt_decimal("amount")?.unwrap_or(Decimal::ZERO),
            })
        }
        "confirmations" => {
            let r = row(&["reservation_id"])?;
            Ok(Command::ConfirmReservation {
                reservation_id: r.ulid("reservation_id")?,
            })
        }
        "cancellations" => {
            let r = row(&["reservation_id", "actor_id", "reason"])?;
            Ok(Command::CancelReservation {
                reservation_id: r.ulid("reservation_id")?,
                actor_id: r.ulid("actor_id")?,
                reason: r.opt_text("reason")?,
            })
        }
        "reschedules" => {
            let r = row(&["reservation_id", "actor_id", "new_id", "start", "end"])?;
            Ok(Command::RescheduleReservation {
                reservation_id: r.ulid("reservation_id")?,
                actor_id: r.ulid("actor_id")?,
                new_id: r.ulid("new_id")?,
                start: r.i64("start")?,
                end: r.i64("end")?,
            })
        }
        "completions" => {
            let r = row(&["reservation_id"])?;
            Ok(Command::CompleteReservation {
                reservation_id: r.ulid("reservation_id")?,
            })
        }
        "no_shows" => {
            let r = row(&["reservation_id"])?;
            Ok(Command::MarkNoShow {
                reservation_id: r.ulid("reservation_id")?,
            })
        }
        "status_overrides" => {
            let r = row(&["reservation_id", "status", "note"])?;
            let status = r.text("status")?;
            Ok(Command::OverrideStatus {
                reservation_id: r.ulid("reservation_id")?,
                status: status.parse().map_err(|e: String| SqlError::BadValue("status", e))?,
                note: r.opt_text("note")?,
            })
        }
        "payments" => {
            let r = row(&["id", "customer_id", "host_id", "amount", "reservation_id", "description"])?;
            Ok(Command::InsertPayment {
                id: r.ulid("id")?,
                customer_id: r.ulid("customer_id")?,
                host_id: r.ulid("host_id")?,
                amount: r.decimal("amount")?,
                reservation_id: r.opt_ulid("reservation_id")?,
                description: r.opt_text("description")?,
            })
        }
        "captures" => {
            let r = row(&["intent_ref"])?;
            Ok(Command::CapturePayment {
                intent_ref: r.text("intent_ref")?,
            })
        }
        "refunds" => {
            let r = row(&["transaction_id", "reason"])?;
            Ok(Command::RefundTransaction {
                transaction_id: r.ulid("transaction_id")?,
                reason: r.opt_text("reason")?,
            })
        }
        "settlement_runs" => {
            let r = row(&["at"])?;
            Ok(Command::RunSettlement { at: r.opt_i64("at")? })
        }
        "webhooks" => {
            let r = row(&["payload", "signature"])?;
            Ok(Command::Webhook {
                payload: r.text("payload")?,
                signature: r.text("signature")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_recurrence(kind: &str, days: Option<&str>) -> Result<Recurrence, SqlError> {
    match kind.to_ascii_lowercase().as_str() {
        "once" => Ok(Recurrence::Once),
        "daily" => Ok(Recurrence::Daily),
        "weekly" => {
            let days = match days {
                Some(d) => d.parse().map_err(|e: ParseWeekdayError| SqlError::BadValue("days", e.to_string()))?,
                None => WeekdaySet::EMPTY,
            };
            Ok(Recurrence::Weekly { days })
        }
        other => Err(SqlError::BadValue("recurrence", format!("unknown recurrence: {other}"))),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "availabilities" => Ok(Command::RetireAvailability { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            host_id: filters.required_ulid("host_id")?,
            start: filters.required_i64(Op::GtEq, "start")?,
            end: filters.required_i64(Op::LtEq, "end")?,
        }),
        "slots" => Ok(Command::SelectSlot {
            host_id: filters.required_ulid("host_id")?,
            start: filters.required_i64(Op::Eq, "start")?,
            end: filters.required_i64(Op::Eq, "end")?,
        }),
        "reservations" => {
            let upcoming = match filters.get(Op::Eq, "upcoming") {
                Some(e) => parse_bool(e)?,
                None => false,
            };
            let id = filters.opt_ulid("id")?;
            let host = filters.opt_ulid("host_id")?;
            let customer = filters.opt_ulid("customer_id")?;
            let user = filters.opt_ulid("user_id")?;
            let filter = if upcoming {
                let who = user
                    .or(host)
                    .or(customer)
                    .ok_or(SqlError::MissingFilter("user_id"))?;
                ReservationFilter::Upcoming(who)
            } else if let Some(id) = id {
                ReservationFilter::Id(id)
            } else if let Some(host) = host {
                ReservationFilter::Host(host)
            } else if let Some(customer) = customer.or(user) {
                ReservationFilter::Customer(customer)
            } else {
                ReservationFilter::All
            };
            Ok(Command::SelectReservations { filter })
        }
        "transactions" => {
            let filter = if let Some(id) = filters.opt_ulid("id")? {
                TransactionFilter::Id(id)
            } else if let Some(user) = filters
                .opt_ulid("user_id")?
                .or(filters.opt_ulid("customer_id")?)
                .or(filters.opt_ulid("host_id")?)
            {
                TransactionFilter::User(user)
            } else {
                TransactionFilter::All
            };
            Ok(Command::SelectTransactions { filter })
        }
        "transaction_stats" => Ok(Command::SelectTransactionStats),
        "call_tokens" => Ok(Command::SelectCallToken {
            reservation_id: filters.required_ulid("reservation_id")?,
            user_id: filters.required_ulid("user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunction of `column <op> literal` terms.
#[derive(Default)]
struct Filters<'a> {
    terms: Vec<(Op, String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn get(&self, op: Op, column: &str) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(o, c, _)| *o == op && c == column)
            .map(|(_, _, e)| *e)
    }

    fn opt_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(Op::Eq, column).map(parse_ulid_expr).transpose()
    }

    fn required_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(column)?.ok_or(SqlError::MissingFilter(column))
    }

    fn required_i64(&self, op: Op, column: &'static str) -> Result<i64, SqlError> {
        let expr = self.get(op, column).ok_or(SqlError::MissingFilter(column))?;
        parse_i64_expr(expr)
    }
}

fn collect_filters<'a>(expr: &'a Expr, filters: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, filters)?;
                    return collect_filters(right, filters);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("left side of filter: {left}")))?;
            filters.terms.push((op, column, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter: {other}"))),
    }
}

// ── INSERT rows ───────────────────────────────────────────────

/// One VALUES row addressed by column name. Without a column list the
/// values are matched against the table's default column order.
struct InsertRow {
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl InsertRow {
    fn new(insert: &ast::Insert, defaults: &[&str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(columns.len(), values.len()));
        }
        Ok(Self { columns, values })
    }

    /// The value for `column`, or `None` if absent or NULL.
    fn get(&self, column: &str) -> Option<&Expr> {
        let expr = self
            .columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))?;
        match extract_value(expr) {
            Some(Value::Null) => None,
            _ => Some(expr),
        }
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(column)?)
    }

    fn opt_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid_expr).transpose()
    }

    fn i64(&self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.required(column)?)
    }

    fn opt_i64(&self, column: &'static str) -> Result<Option<i64>, SqlError> {
        self.get(column).map(parse_i64_expr).transpose()
    }

    fn decimal(&self, column: &'static str) -> Result<Decimal, SqlError> {
        parse_decimal_expr(self.required(column)?)
    }

    fn opt_decimal(&self, column: &'static str) -> Result<Option<Decimal>, SqlError> {
        self.get(column).map(parse_decimal_expr).transpose()
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_text_expr(self.required(column)?)
    }

    fn opt_text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_text_expr).transpose()
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
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
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
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
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

fn parse_decimal_expr(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                Decimal::from_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad decimal {s}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_decimal_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(s.clone())
        }
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("expected at most {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad value for {0}: {1}")]
    BadValue(&'static str, String),
}
