use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::*;

use super::{Engine, EngineError};

fn check_text(value: &str, what: &'static str) -> Result<(), EngineError> {
    if value.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    /// Register a host or update its mirror. Fields passed as `None` keep
    /// their current values.
    pub async fn upsert_host(
        &self,
        id: Ulid,
        email: Option<String>,
        payout_account: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(e) = &email {
            check_text(e, "host email too long")?;
        }
        if let Some(p) = &payout_account {
            check_text(p, "payout account reference too long")?;
        }
        let _gate = self.begin_write().await;
        let event = Event::HostUpserted {
            id,
            email,
            payout_account,
        };
        match self.host(&id) {
            Some(hs) => {
                let mut guard = hs.write().await;
                self.persist_and_apply(&mut guard, &event).await
            }
            None => self.persist_and_insert(event).await,
        }
    }

    /// Register a customer or update its mirror. The gateway customer
    /// reference survives updates.
    pub async fn upsert_customer(&self, id: Ulid, email: String, name: String) -> Result<(), EngineError> {
        check_text(&email, "customer email too long")?;
        check_text(&name, "customer name too long")?;
        if email.is_empty() {
            return Err(EngineError::Validation("customer email required".into()));
        }
        let _gate = self.begin_write().await;
        let gateway_customer = self.customer(&id).and_then(|c| c.gateway_customer);
        self.persist_and_insert(Event::CustomerUpserted(CustomerInfo {
            id,
            email,
            name,
            gateway_customer,
        }))
        .await
    }

    /// Open a payout destination for the host with the gateway and store it.
    pub async fn create_payout_account(&self, host_id: Ulid, country: &str) -> Result<String, EngineError> {
        let country = country.trim().to_ascii_uppercase();
        if country.len() != 2 {
            return Err(EngineError::Validation(format!("bad country code: {country}")));
        }
        let _gate = self.begin_write().await;
        let hs = self.require_host(&host_id)?;
        let mut guard = hs.write().await;
        if let Some(existing) = &guard.payout_account {
            return Ok(existing.clone());
        }
        let email = guard
            .email
            .clone()
            .ok_or_else(|| EngineError::Validation("host has no email on file".into()))?;

        let account = self
            .call_gateway(
                "create_connect_account",
                self.services.payments.create_connect_account(&email, &country),
            )
            .await?;
        let event = Event::HostUpserted {
            id: host_id,
            email: None,
            payout_account: Some(account.clone()),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("host {host_id} payout account opened in {country}");
        Ok(account)
    }

    /// Gateway customer reference for `customer_id`, created on first use.
    pub(super) async fn ensure_gateway_customer(&self, customer_id: Ulid) -> Result<String, EngineError> {
        let customer = self
            .customer(&customer_id)
            .ok_or(EngineError::NotFound(customer_id))?;
        if let Some(existing) = customer.gateway_customer {
            return Ok(existing);
        }
        let reference = self
            .call_gateway(
                "create_customer",
                self.services.payments.create_customer(&customer.email, &customer.name),
            )
            .await?;
        self.persist_and_insert(Event::CustomerUpserted(CustomerInfo {
            gateway_customer: Some(reference.clone()),
            ..customer
        }))
        .await?;
        Ok(reference)
    }
}
