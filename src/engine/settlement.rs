use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::model::*;
use crate::notify::{Notification, NotificationKind};

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Flag every COMPLETED, unreleased entry older than the retention
    /// period as released. Returns the entries flagged by this call; a second
    /// run at the same instant returns nothing. Each entry is announced as
    /// soon as its flag is durable, so a WAL failure partway through still
    /// leaves the earlier releases reported.
    pub async fn process_releases(&self, now: Ms) -> Result<Vec<EscrowEntry>, EngineError> {
        let cutoff = now - self.settings.retention_ms();
        let _gate = self.begin_write().await;
        let mut released = Vec::new();
        for shared in self.ledger_snapshot() {
            let mut entry = shared.write().await;
            if entry.status != TransactionStatus::Completed || entry.is_released || entry.created_at > cutoff {
                continue;
            }
            let event = Event::EscrowReleased {
                id: entry.id,
                released_at: now,
            };
            if let Err(e) = self.persist_and_apply_entry(&mut entry, &event).await {
                warn!("release of {} failed after {} released: {e}", entry.id, released.len());
                return Err(e);
            }
            let flagged = entry.clone();
            drop(entry);
            self.announce_release(&flagged);
            released.push(flagged);
        }
        Ok(released)
    }

    fn announce_release(&self, entry: &EscrowEntry) {
        metrics::counter!(crate::observability::RELEASES_TOTAL).increment(1);
        info!("transaction {} released {} {} to host {}", entry.id, entry.net, entry.currency, entry.host_id);
        self.notify(
            Notification::app(entry.host_id, NotificationKind::FundsReleased, "Funds released", "")
                .related(entry.id)
                .with_metadata(serde_json::json!({
                    "net": entry.net.to_string(),
                    "currency": entry.currency,
                })),
        );
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    /// Holds the write gate exclusively for the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();

        let hosts: Vec<_> = self.hosts.iter().map(|e| e.value().clone()).collect();
        let mut host_rows = Vec::new();
        for hs in &hosts {
            let guard = hs.read().await;
            events.push(Event::HostUpserted {
                id: guard.id,
                email: guard.email.clone(),
                payout_account: guard.payout_account.clone(),
            });
            host_rows.extend(guard.availabilities.iter().cloned().map(Event::AvailabilityAdded));
            host_rows.extend(guard.reservations.iter().cloned().map(Event::ReservationCreated));
        }
        events.extend(self.customers.iter().map(|e| Event::CustomerUpserted(e.value().clone())));
        events.append(&mut host_rows);
        for shared in self.ledger_snapshot() {
            events.push(Event::EscrowCreated(shared.read().await.clone()));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
