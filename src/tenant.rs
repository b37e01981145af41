use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper::{self, SweepIntervals};

/// One tenant's engine and the hub its connections LISTEN on.
#[derive(Clone)]
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// sweeper + compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Tenant>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: Policy,
    intervals: SweepIntervals,
}

fn sanitize(tenant: &str) -> std::io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    // Path traversal guard: the name becomes a file name.
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe)
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        policy: Policy,
        intervals: SweepIntervals,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
            intervals,
        }
    }

    /// Get or lazily create the tenant. Must run inside a tokio runtime.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Tenant> {
        if let Some(t) = self.tenants.get(tenant) {
            return Ok(t.value().clone());
        }
        let safe_name = sanitize(tenant)?;
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Holding the entry keeps two first connections from opening the
        // same WAL twice.
        let slot = match self.tenants.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => v,
        };
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let hub = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, hub.clone(), self.policy)?);

        tokio::spawn(sweeper::run_sweeper(engine.clone(), self.intervals));
        tokio::spawn(sweeper::run_compactor(engine.clone(), self.compact_threshold));

        let created = Tenant { engine, hub };
        slot.insert(created.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        tracing::info!(tenant = %safe_name, "tenant loaded");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("evfleet_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, Policy::default(), SweepIntervals::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let a = tm.get_or_create("fleet_a").unwrap();
        let b = tm.get_or_create("fleet_b").unwrap();

        // Same station id and name in both tenants.
        let sid = Ulid::new();
        a.engine
            .create_station(sid, "Depot".into(), "Dock 1".into())
            .await
            .unwrap();
        b.engine
            .create_station(sid, "Depot".into(), "Dock 9".into())
            .await
            .unwrap();

        a.engine
            .create_vehicle(Ulid::new(), sid, "Ioniq".into(), 1_000, None)
            .await
            .unwrap();
        assert_eq!(a.engine.search_vehicles(None, None).await.unwrap().len(), 1);
        assert!(b.engine.search_vehicles(None, None).await.unwrap().is_empty());
        assert!(!Arc::ptr_eq(&a.hub, &b.hub));
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _t = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let t1 = tm.get_or_create("foo").unwrap();
        let t2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&t1.engine, &t2.engine));
        assert!(Arc::ptr_eq(&t1.hub, &t2.hub));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _t = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = test_data_dir("reload");
        let sid = Ulid::new();
        {
            let tm = manager(dir.clone());
            let t = tm.get_or_create("fleet").unwrap();
            t.engine
                .create_station(sid, "West".into(), "Lane 4".into())
                .await
                .unwrap();
        }
        let tm = manager(dir);
        let t = tm.get_or_create("fleet").unwrap();
        let stations: Vec<Station> = t.engine.list_stations();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].id, sid);
    }
}
