use std::cmp::Reverse;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedEscrowEntry, SharedHostState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    Id(Ulid),
    /// Latest start first.
    Host(Ulid),
    /// Latest start first.
    Customer(Ulid),
    /// CONFIRMED sessions not yet started where the user takes part, soonest first.
    Upcoming(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionFilter {
    All,
    Id(Ulid),
    /// Entries where the user pays or is paid.
    User(Ulid),
}

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let host_id = self.host_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let hs = self.require_host(&host_id)?;
        let guard = hs.read().await;
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn list_reservations(&self, filter: ReservationFilter, now: Ms) -> Vec<Reservation> {
        let mut out = match filter {
            ReservationFilter::Id(id) => return self.get_reservation(id).await.into_iter().collect(),
            ReservationFilter::Host(host_id) => match self.host(&host_id) {
                Some(hs) => hs.read().await.reservations.clone(),
                None => Vec::new(),
            },
            ReservationFilter::All => self.collect_reservations(|_| true).await,
            ReservationFilter::Customer(user) => self.collect_reservations(|r| r.customer_id == user).await,
            ReservationFilter::Upcoming(user) => {
                let mut upcoming = self
                    .collect_reservations(|r| {
                        r.is_participant(user) && r.status == ReservationStatus::Confirmed && r.span.start >= now
                    })
                    .await;
                upcoming.sort_by_key(|r| (r.span.start, r.id));
                return upcoming;
            }
        };
        out.sort_by_key(|r| (Reverse(r.span.start), r.id));
        out
    }

    async fn collect_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let hosts: Vec<SharedHostState> = self.hosts.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for hs in hosts {
            let guard = hs.read().await;
            out.extend(guard.reservations.iter().filter(|r| keep(r)).cloned());
        }
        out
    }

    pub async fn get_transaction(&self, id: Ulid) -> Result<EscrowEntry, EngineError> {
        let entry = self.require_entry(&id)?;
        let guard = entry.read().await;
        Ok(guard.clone())
    }

    /// Ledger rows, newest first.
    pub async fn list_transactions(&self, filter: TransactionFilter) -> Vec<EscrowEntry> {
        if let TransactionFilter::Id(id) = filter {
            return self.get_transaction(id).await.into_iter().collect();
        }
        let mut out = Vec::new();
        for shared in self.ledger_snapshot() {
            let entry = shared.read().await;
            let keep = match filter {
                TransactionFilter::All => true,
                TransactionFilter::User(user) => entry.is_party(user),
                TransactionFilter::Id(id) => entry.id == id,
            };
            if keep {
                out.push(entry.clone());
            }
        }
        out.sort_by_key(|e| (Reverse(e.created_at), e.id));
        out
    }

    /// Totals over COMPLETED entries. Revenue is what the platform keeps:
    /// commission plus VAT.
    pub async fn transaction_stats(&self) -> LedgerStats {
        let mut stats = LedgerStats::default();
        for shared in self.ledger_snapshot() {
            let entry = shared.read().await;
            if entry.status != TransactionStatus::Completed {
                continue;
            }
            stats.completed_count += 1;
            stats.total_amount += entry.amount;
            stats.total_commission += entry.commission;
            stats.total_vat += entry.vat;
        }
        stats.total_revenue = stats.total_commission + stats.total_vat;
        stats
    }

    pub(super) fn ledger_snapshot(&self) -> Vec<SharedEscrowEntry> {
        self.ledger.iter().map(|e| e.value().clone()).collect()
    }
}
