mod availability;
mod calls;
mod conflict;
mod error;
mod escrow;
mod lifecycle;
mod parties;
mod queries;
mod reservations;
mod saga;
mod schedule;
mod settlement;
#[cfg(test)]
mod tests;

pub use availability::{covering, expand, floor_day, occurrences, project};
pub use calls::{call_uid, channel_for, CallGrant, CALL_TOKEN_TTL_MS, EARLY_JOIN_MS};
pub use error::EngineError;
pub use lifecycle::{Actor, CANCELLATION_NOTICE_MS, RESCHEDULE_REASON};
pub use queries::{ReservationFilter, TransactionFilter};
pub use saga::{CaptureOutcome, Compensation, WebhookOutcome};

pub(crate) use conflict::now_ms;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::gateway::{GatewayError, PaymentGateway, SandboxGateway, SandboxTokenAuthority, TokenAuthority};
use crate::model::*;
use crate::money::FeeSchedule;
use crate::notify::{Notification, Notifier, NotifyHub};
use crate::wal::Wal;

pub type SharedHostState = Arc<RwLock<HostState>>;
pub type SharedEscrowEntry = Arc<RwLock<EscrowEntry>>;

/// Business settings fixed for the lifetime of an engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub fees: FeeSchedule,
    /// Days a captured payment is held before release.
    pub retention_days: u32,
    pub currency: String,
    pub gateway_timeout: Duration,
    pub slot_policy: SlotPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fees: FeeSchedule::default(),
            retention_days: 7,
            currency: "EUR".into(),
            gateway_timeout: Duration::from_secs(10),
            slot_policy: SlotPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn retention_ms(&self) -> Ms {
        Ms::from(self.retention_days) * DAY_MS
    }
}

/// External collaborators an engine talks to.
#[derive(Clone)]
pub struct Services {
    pub payments: Arc<dyn PaymentGateway>,
    pub tokens: Arc<dyn TokenAuthority>,
    pub notifier: Arc<dyn Notifier>,
}

impl Services {
    /// In-process sandbox gateway and token authority with a local notify hub.
    pub fn sandbox(webhook_secret: &str) -> Self {
        Self {
            payments: Arc::new(SandboxGateway::new(webhook_secret)),
            tokens: Arc::new(SandboxTokenAuthority::new("hostbook")),
            notifier: Arc::new(NotifyHub::new()),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Takes the first queued append, drains whatever else is
/// already waiting, then commits the whole batch with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL batch of {} failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes do not leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One tenant's booking and escrow state.
///
/// Hosts own their availabilities and reservations behind one lock each.
/// Ledger entries have their own locks. A host lock is never held while an
/// entry lock is acquired.
pub struct Engine {
    pub(super) hosts: DashMap<Ulid, SharedHostState>,
    pub(super) customers: DashMap<Ulid, CustomerInfo>,
    pub(super) ledger: DashMap<Ulid, SharedEscrowEntry>,
    /// Gateway intent ref → ledger entry id.
    pub(super) intent_index: DashMap<String, Ulid>,
    /// Reservation or availability id → host id.
    pub(super) entity_to_host: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared; compaction holds it exclusively so no
    /// append lands between snapshot and swap.
    pub(super) write_gate: RwLock<()>,
    pub(super) services: Services,
    pub(super) settings: EngineSettings,
}

/// Apply a host-scoped event. Caller holds the host lock.
fn apply_to_host(hs: &mut HostState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::HostUpserted {
            email,
            payout_account,
            ..
        } => {
            if email.is_some() {
                hs.email = email.clone();
            }
            if payout_account.is_some() {
                hs.payout_account = payout_account.clone();
            }
        }
        Event::AvailabilityAdded(avail) => {
            hs.availabilities.retain(|a| a.id != avail.id);
            hs.availabilities.push(avail.clone());
            entity_map.insert(avail.id, hs.id);
        }
        Event::AvailabilityRetired { id, .. } => {
            if let Some(avail) = hs.availability_mut(*id) {
                avail.active = false;
            }
        }
        Event::ReservationCreated(reservation) => {
            hs.insert_reservation(reservation.clone());
            entity_map.insert(reservation.id, hs.id);
        }
        Event::ReservationStatusChanged {
            id,
            status,
            reason,
            note,
            ..
        } => {
            if let Some(r) = hs.reservation_mut(*id) {
                r.status = *status;
                if reason.is_some() {
                    r.cancellation_reason = reason.clone();
                }
                if note.is_some() {
                    r.notes = note.clone();
                }
            }
        }
        Event::ReservationRescheduled {
            original_id,
            replacement,
            ..
        } => {
            if let Some(original) = hs.reservation_mut(*original_id) {
                original.status = ReservationStatus::Cancelled;
                original.cancellation_reason = Some(RESCHEDULE_REASON.to_string());
            }
            hs.insert_reservation(replacement.clone());
            entity_map.insert(replacement.id, hs.id);
        }
        Event::EscrowCreated(entry) => {
            if let Some(rid) = entry.reservation_id
                && entry.status != TransactionStatus::Failed
            {
                link_transaction(hs, rid, entry.id);
            }
        }
        Event::CustomerUpserted(_)
        | Event::EscrowCaptured { .. }
        | Event::EscrowFailed { .. }
        | Event::EscrowRefunded { .. }
        | Event::EscrowReleased { .. } => {}
    }
}

/// Point an unlinked reservation at its payment.
fn link_transaction(hs: &mut HostState, reservation_id: Ulid, transaction_id: Ulid) {
    if let Some(r) = hs.reservation_mut(reservation_id)
        && r.transaction_id.is_none()
    {
        r.transaction_id = Some(transaction_id);
    }
}

/// A declined payment no longer pays for anything: open reservations that
/// point at it become payable again. Finished ones keep their history.
fn unlink_transaction(hs: &mut HostState, transaction_id: Ulid) {
    for r in hs.reservations.iter_mut() {
        if r.transaction_id == Some(transaction_id) && !r.status.is_terminal() {
            r.transaction_id = None;
        }
    }
}

/// Apply a ledger event. Caller holds the entry lock.
fn apply_to_entry(entry: &mut EscrowEntry, event: &Event) {
    match event {
        Event::EscrowCaptured { charge_ref, .. } => {
            entry.status = TransactionStatus::Completed;
            if charge_ref.is_some() {
                entry.charge_ref = charge_ref.clone();
            }
        }
        Event::EscrowFailed { .. } => entry.status = TransactionStatus::Failed,
        Event::EscrowRefunded { reason, .. } => {
            entry.status = TransactionStatus::Refunded;
            if reason.is_some() {
                entry.notes = reason.clone();
            }
        }
        Event::EscrowReleased { released_at, .. } => {
            entry.is_released = true;
            entry.released_at = Some(*released_at);
        }
        _ => {}
    }
}

/// Host a host-scoped event belongs to.
fn event_host_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::HostUpserted { id, .. } => Some(*id),
        Event::AvailabilityAdded(a) => Some(a.host_id),
        Event::AvailabilityRetired { host_id, .. }
        | Event::ReservationStatusChanged { host_id, .. }
        | Event::ReservationRescheduled { host_id, .. } => Some(*host_id),
        Event::ReservationCreated(r) => Some(r.host_id),
        Event::EscrowCreated(e) => Some(e.host_id),
        Event::CustomerUpserted(_)
        | Event::EscrowCaptured { .. }
        | Event::EscrowFailed { .. }
        | Event::EscrowRefunded { .. }
        | Event::EscrowReleased { .. } => None,
    }
}

/// Ledger entry a ledger event belongs to.
fn event_entry_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::EscrowCaptured { id, .. }
        | Event::EscrowFailed { id }
        | Event::EscrowRefunded { id, .. }
        | Event::EscrowReleased { id, .. } => Some(*id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, settings: EngineSettings, services: Services) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if let Some(offset) = replay.damaged_at {
            warn!(
                "{}: dropped damaged WAL tail at byte {offset} after {} events",
                wal_path.display(),
                replay.events.len()
            );
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            hosts: DashMap::new(),
            customers: DashMap::new(),
            ledger: DashMap::new(),
            intent_index: DashMap::new(),
            entity_to_host: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
            services,
            settings,
        };

        // Sole owner of every lock here, so try_write always succeeds. Never
        // block: this may run inside an async context (lazy tenant creation).
        for event in &replay.events {
            engine.replay_event(event);
        }
        info!(
            "{}: replayed {} events ({} hosts, {} ledger entries)",
            wal_path.display(),
            replay.events.len(),
            engine.hosts.len(),
            engine.ledger.len()
        );
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::HostUpserted {
                id,
                email,
                payout_account,
            } if !self.hosts.contains_key(id) => {
                let hs = HostState::new(*id, email.clone(), payout_account.clone());
                self.hosts.insert(*id, Arc::new(RwLock::new(hs)));
            }
            Event::CustomerUpserted(customer) => {
                self.customers.insert(customer.id, customer.clone());
            }
            Event::EscrowCreated(entry) => {
                self.insert_entry(entry.clone());
                self.replay_on_host(event);
            }
            Event::EscrowFailed { id } => {
                self.replay_on_entry(event);
                self.replay_unlink(id);
            }
            _ => {
                if event_entry_id(event).is_some() {
                    self.replay_on_entry(event);
                } else {
                    self.replay_on_host(event);
                }
            }
        }
    }

    fn replay_on_host(&self, event: &Event) {
        let Some(host) = event_host_id(event).and_then(|id| self.host(&id)) else {
            return;
        };
        if let Ok(mut guard) = host.try_write() {
            apply_to_host(&mut guard, event, &self.entity_to_host);
        }
    }

    fn replay_on_entry(&self, event: &Event) {
        let Some(entry) = event_entry_id(event).and_then(|id| self.entry(&id)) else {
            return;
        };
        if let Ok(mut guard) = entry.try_write() {
            apply_to_entry(&mut guard, event);
        }
    }

    fn replay_unlink(&self, entry_id: &Ulid) {
        let Some(entry) = self.entry(entry_id) else {
            return;
        };
        let host_id = match entry.try_read() {
            Ok(guard) => guard.host_id,
            Err(_) => return,
        };
        if let Some(host) = self.host(&host_id)
            && let Ok(mut guard) = host.try_write()
        {
            unlink_transaction(&mut guard, *entry_id);
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Shared hold on the write gate. Every public mutation takes it first,
    /// before any host or entry lock.
    pub(super) async fn begin_write(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read().await
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn host(&self, id: &Ulid) -> Option<SharedHostState> {
        self.hosts.get(id).map(|e| e.value().clone())
    }

    pub fn entry(&self, id: &Ulid) -> Option<SharedEscrowEntry> {
        self.ledger.get(id).map(|e| e.value().clone())
    }

    pub fn customer(&self, id: &Ulid) -> Option<CustomerInfo> {
        self.customers.get(id).map(|e| e.value().clone())
    }

    pub fn host_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_host.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn require_host(&self, id: &Ulid) -> Result<SharedHostState, EngineError> {
        self.host(id).ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn require_entry(&self, id: &Ulid) -> Result<SharedEscrowEntry, EngineError> {
        self.entry(id).ok_or(EngineError::NotFound(*id))
    }

    /// WAL-append, then apply to the locked host.
    pub(super) async fn persist_and_apply(&self, hs: &mut HostState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_host(hs, event, &self.entity_to_host);
        Ok(())
    }

    /// Claim `id` in the entity index for the locked host, then WAL-append and
    /// apply `event`. The claim is atomic across hosts and is dropped again
    /// if the append fails.
    pub(super) async fn persist_new_entity(
        &self,
        hs: &mut HostState,
        id: Ulid,
        event: &Event,
    ) -> Result<(), EngineError> {
        match self.entity_to_host.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(hs.id);
            }
        }
        if let Err(e) = self.persist_and_apply(hs, event).await {
            self.entity_to_host.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Persist a new ledger entry while the owning host is write-locked, so
    /// the reservation link and the entry appear together.
    pub(super) async fn persist_entry(&self, hs: &mut HostState, entry: EscrowEntry) -> Result<(), EngineError> {
        self.persist_and_apply(hs, &Event::EscrowCreated(entry.clone())).await?;
        self.insert_entry(entry);
        Ok(())
    }

    /// Make the reservation behind a declined payment payable again. Caller
    /// holds the write gate and no other lock.
    pub(super) async fn unlink_failed(&self, entry: &EscrowEntry) {
        if entry.reservation_id.is_none() {
            return;
        }
        if let Some(host) = self.host(&entry.host_id) {
            unlink_transaction(&mut *host.write().await, entry.id);
        }
    }

    /// WAL-append, then apply to the locked ledger entry.
    pub(super) async fn persist_and_apply_entry(
        &self,
        entry: &mut EscrowEntry,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_entry(entry, event);
        Ok(())
    }

    /// WAL-append an event that creates a top-level record, then insert it.
    pub(super) async fn persist_and_insert(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        match event {
            Event::HostUpserted {
                id,
                email,
                payout_account,
            } => {
                let hs = HostState::new(id, email, payout_account);
                self.hosts.insert(id, Arc::new(RwLock::new(hs)));
            }
            Event::CustomerUpserted(customer) => {
                self.customers.insert(customer.id, customer);
            }
            other => {
                return Err(EngineError::WalError(format!(
                    "event is not a top-level insert: {other:?}"
                )));
            }
        }
        Ok(())
    }

    fn insert_entry(&self, entry: EscrowEntry) {
        if let Some(intent) = &entry.intent_ref {
            self.intent_index.insert(intent.clone(), entry.id);
        }
        self.ledger.insert(entry.id, Arc::new(RwLock::new(entry)));
    }

    /// Lookup reservation → host, acquire the host write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<HostState>, EngineError> {
        let host_id = self
            .host_for_entity(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let hs = self.require_host(&host_id)?;
        Ok(hs.write_owned().await)
    }

    pub(super) fn notify(&self, notification: Notification) {
        self.services.notifier.notify(notification);
    }

    /// Run a gateway call under the configured timeout, with latency and
    /// failure metrics.
    pub(super) async fn call_gateway<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, EngineError> {
        let started = Instant::now();
        let result = tokio::time::timeout(self.settings.gateway_timeout, call).await;
        metrics::histogram!(crate::observability::GATEWAY_CALL_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                metrics::counter!(crate::observability::GATEWAY_FAILURES_TOTAL, "op" => op, "reason" => "error")
                    .increment(1);
                warn!("gateway {op} failed: {e}");
                Err(e.into())
            }
            Err(_) => {
                metrics::counter!(crate::observability::GATEWAY_FAILURES_TOTAL, "op" => op, "reason" => "timeout")
                    .increment(1);
                let ms = u64::try_from(self.settings.gateway_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!("gateway {op} timed out after {ms} ms");
                Err(EngineError::GatewayTimeout(ms))
            }
        }
    }
}
