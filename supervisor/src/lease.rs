use crate::client::SupervisorClient;
use crate::error::SupervisorError;
use crate::types::{GC_EXPIRE_LABEL, Lease};
use berth_core::Context;
use std::collections::HashMap;
use tracing::{debug, info};

pub const DEFAULT_LEASE_ID: &str = "container-management.lease";

/// Makes sure the lease `id` exists without an expiry.
///
/// An existing lease without the expiry label is adopted. One carrying the
/// label was created by something else and is deleted and recreated so its
/// resources are not collected underneath running containers.
pub async fn bootstrap_lease(
    client: &dyn SupervisorClient,
    ctx: &Context,
    id: &str,
) -> Result<Lease, SupervisorError> {
    let existing = client
        .list_leases(ctx)
        .await?
        .into_iter()
        .find(|lease| lease.id == id);

    if let Some(lease) = existing {
        if !lease.labels.contains_key(GC_EXPIRE_LABEL) {
            debug!("Adopting existing lease {}", id);
            return Ok(lease);
        }
        info!("Lease {} carries an expiry, recreating it", id);
        client.delete_lease(ctx, id, false).await?;
    }

    info!("Creating lease {}", id);
    client.create_lease(ctx, id, HashMap::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeSupervisor;

    fn ctx() -> Context {
        Context::background().with_namespace("test")
    }

    #[tokio::test]
    async fn test_creates_missing_lease() {
        let fake = FakeSupervisor::new();
        let lease = bootstrap_lease(&fake, &ctx(), DEFAULT_LEASE_ID)
            .await
            .unwrap();
        assert_eq!(lease.id, DEFAULT_LEASE_ID);
        assert_eq!(fake.lease_ids(), vec![DEFAULT_LEASE_ID.to_string()]);
    }

    #[tokio::test]
    async fn test_adopts_lease_without_expiry() {
        let fake = FakeSupervisor::new();
        let mut labels = HashMap::new();
        labels.insert("owner".to_string(), "us".to_string());
        fake.seed_lease("l1", labels);

        let lease = bootstrap_lease(&fake, &ctx(), "l1").await.unwrap();
        assert_eq!(lease.labels.get("owner").map(String::as_str), Some("us"));
        assert!(!fake.operations().contains(&"delete_lease".to_string()));
    }

    #[tokio::test]
    async fn test_recreates_lease_with_expiry() {
        let fake = FakeSupervisor::new();
        let mut labels = HashMap::new();
        labels.insert(GC_EXPIRE_LABEL.to_string(), "2024-01-01T00:00:00Z".to_string());
        fake.seed_lease("l1", labels);

        let lease = bootstrap_lease(&fake, &ctx(), "l1").await.unwrap();
        assert!(lease.labels.is_empty());
        assert!(fake.operations().contains(&"delete_lease".to_string()));
        assert_eq!(fake.lease_ids(), vec!["l1".to_string()]);
    }
}
