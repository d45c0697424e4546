use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::tenant::tenant_file_stem;

/// Single shared password for every tenant. The database name picks the
/// tenant, so a name that cannot map to a WAL file is refused at login.
#[derive(Debug)]
pub struct HostbookAuthSource {
    password: String,
}

impl HostbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for HostbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Some(db) = login.database()
            && let Err(e) = tenant_file_stem(db)
        {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL, "reason" => "tenant").increment(1);
            tracing::warn!("login refused for database {db:?}: {e}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "3D000".into(),
                format!("invalid tenant name: {e}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
