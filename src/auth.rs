use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::authz;
use crate::observability;
use crate::tenant::TenantManager;

/// Shared-password login. The login name must be the operator account or
/// an active user registered in the tenant being connected to.
pub struct FleetAuthSource {
    password: String,
    operator: String,
    tenants: Arc<TenantManager>,
}

impl FleetAuthSource {
    pub fn new(password: String, operator: String, tenants: Arc<TenantManager>) -> Self {
        Self {
            password,
            operator,
            tenants,
        }
    }
}

impl fmt::Debug for FleetAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetAuthSource")
            .field("operator", &self.operator)
            .finish_non_exhaustive()
    }
}

fn reject(code: &str, message: String) -> PgWireError {
    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
    PgWireError::UserError(Box::new(ErrorInfo::new("FATAL".into(), code.into(), message)))
}

#[async_trait]
impl AuthSource for FleetAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if user != self.operator {
            let tenant = self
                .tenants
                .get_or_create(login.database().unwrap_or("default"))
                .map_err(|e| reject("08006", format!("tenant error: {e}")))?;
            if let Err(e) = authz::resolve_actor(&tenant.engine, user, &self.operator) {
                tracing::warn!(user, error = %e, "login rejected");
                return Err(reject(e.sqlstate(), e.to_string()));
            }
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Policy;
    use crate::sweeper::SweepIntervals;

    #[test]
    fn debug_output_hides_the_password() {
        let dir = std::env::temp_dir().join("evfleet_test_auth_debug");
        let tenants = Arc::new(TenantManager::new(
            dir,
            1000,
            Policy::default(),
            SweepIntervals::default(),
        ));
        let source = FleetAuthSource::new("hunter2-secret".into(), "ops".into(), tenants);
        let shown = format!("{source:?}");
        assert!(shown.contains("FleetAuthSource"));
        assert!(shown.contains("ops"));
        assert!(!shown.contains("hunter2-secret"));
    }
}
