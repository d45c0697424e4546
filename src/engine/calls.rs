use tracing::info;
use ulid::Ulid;

use crate::gateway::CallRole;
use crate::model::*;

use super::{Engine, EngineError};

/// Customers may join this long before the session starts.
pub const EARLY_JOIN_MS: Ms = 10 * MINUTE_MS;

/// Lifetime of a minted call token.
pub const CALL_TOKEN_TTL_MS: Ms = 2 * HOUR_MS;

const UID_MODULUS: u32 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallGrant {
    pub token: String,
    pub channel: String,
    pub uid: u32,
    pub role: CallRole,
    pub expires_at: Ms,
}

pub fn channel_for(reservation_id: Ulid) -> String {
    format!("session-{reservation_id}")
}

/// Stable per-user numeric id for the call provider.
pub fn call_uid(user_id: Ulid) -> u32 {
    crc32fast::hash(user_id.to_string().as_bytes()) % UID_MODULUS
}

impl Engine {
    /// Grant a participant access to the session's call. The host may join
    /// any time before the end; the customer from ten minutes before start.
    pub async fn join_call(&self, reservation_id: Ulid, user_id: Ulid, now: Ms) -> Result<CallGrant, EngineError> {
        let host_id = self
            .host_for_entity(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let reservation = {
            let hs = self.require_host(&host_id)?;
            let guard = hs.read().await;
            guard
                .reservation(reservation_id)
                .cloned()
                .ok_or(EngineError::NotFound(reservation_id))?
        };

        if !reservation.is_participant(user_id) {
            return Err(EngineError::Forbidden("not a participant of this reservation"));
        }
        if reservation.status == ReservationStatus::Cancelled {
            return Err(EngineError::Forbidden("reservation was cancelled"));
        }
        let is_host = user_id == reservation.host_id;
        if !is_host && now < reservation.span.start - EARLY_JOIN_MS {
            return Err(EngineError::OutsideWindow("too early to join this call"));
        }
        if now > reservation.span.end {
            return Err(EngineError::OutsideWindow("this session has already ended"));
        }

        let channel = channel_for(reservation_id);
        let uid = call_uid(user_id);
        let role = if is_host {
            CallRole::Publisher
        } else {
            CallRole::Subscriber
        };
        let expires_at = now + CALL_TOKEN_TTL_MS;
        let token = self
            .services
            .tokens
            .mint_token(&channel, uid, role, expires_at)?;
        info!("user {user_id} joining {channel} as {role}");
        Ok(CallGrant {
            token,
            channel,
            uid,
            role,
            expires_at,
        })
    }
}
