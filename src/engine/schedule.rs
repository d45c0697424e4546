use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_AVAILABILITIES_PER_HOST;
use crate::model::*;

use super::availability::{expand, validate_range};
use super::conflict::{check_slot, validate_span};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_availability(
        &self,
        id: Ulid,
        host_id: Ulid,
        span: Span,
        recurrence: Recurrence,
        now: Ms,
    ) -> Result<Availability, EngineError> {
        validate_span(&span)?;
        if let Recurrence::Weekly { days } = recurrence
            && days.is_empty()
        {
            return Err(EngineError::Validation("weekly availability needs at least one weekday".into()));
        }

        let _gate = self.begin_write().await;
        let hs = self.require_host(&host_id)?;
        let mut guard = hs.write().await;
        if guard.availabilities.len() >= MAX_AVAILABILITIES_PER_HOST {
            return Err(EngineError::LimitExceeded("too many availabilities for host"));
        }
        let avail = Availability {
            id,
            host_id,
            span,
            recurrence,
            active: true,
            created_at: now,
        };
        self.persist_new_entity(&mut guard, id, &Event::AvailabilityAdded(avail.clone()))
            .await?;
        info!("host {host_id} opened {} availability {id}", recurrence.label());
        Ok(avail)
    }

    /// Mark an availability inactive. It stays on record but no longer expands.
    pub async fn retire_availability(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.begin_write().await;
        let host_id = self.host_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let hs = self.require_host(&host_id)?;
        let mut guard = hs.write().await;
        match guard.availabilities.iter().find(|a| a.id == id) {
            None => return Err(EngineError::NotFound(id)),
            Some(a) if !a.active => return Ok(()),
            Some(_) => {}
        }
        self.persist_and_apply(&mut guard, &Event::AvailabilityRetired { id, host_id })
            .await
    }

    /// Concrete open intervals for a host within `range`.
    pub async fn expand_availability(&self, host_id: Ulid, range: Span) -> Result<Vec<Occurrence>, EngineError> {
        validate_range(&range)?;
        let hs = self.require_host(&host_id)?;
        let guard = hs.read().await;
        Ok(expand(guard.active_availabilities(), range))
    }

    /// True if the host could take a new booking for `span` right now.
    pub async fn is_host_free(&self, host_id: Ulid, span: Span) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let hs = self.require_host(&host_id)?;
        let guard = hs.read().await;
        match check_slot(&guard, &span, self.settings.slot_policy, None) {
            Ok(()) => Ok(true),
            Err(EngineError::NotCovered { .. } | EngineError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
