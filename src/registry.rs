//! Camera registry: keyed by `(ip, port)`, at most one record per key, guarded by a single
//! lock so readers always see a consistent snapshot.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::onvif::{OnvifInfo, Profile, VideoSource};

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// The registry entity. `profiles == None` means "not yet successfully probed", distinct
/// from `profiles == Some(vec![])` ("probed, device reports no profiles") — collapsing the
/// two would lose that distinction.
#[derive(Debug, Clone)]
pub struct Camera {
    pub ip: String,
    pub port: u16,
    pub service_url: String,
    pub host_name: String,
    pub id: String,
    pub user: String,
    pub password: String,
    pub source: Option<VideoSource>,
    pub profiles: Option<Vec<Profile>>,
    pub join_time: u64,
    pub last_seen: u64,
    pub alive: bool,
    pub max_age: Option<u32>,
}

impl Camera {
    pub fn new(ip: impl Into<String>, port: u16, service_url: impl Into<String>) -> Self {
        let now = now_secs();
        Self {
            ip: ip.into(),
            port,
            service_url: service_url.into(),
            host_name: String::new(),
            id: String::new(),
            user: String::new(),
            password: String::new(),
            source: None,
            profiles: None,
            join_time: now,
            last_seen: now,
            alive: true,
            max_age: None,
        }
    }

    pub fn apply_onvif_info(&mut self, info: OnvifInfo) {
        self.host_name = info.host_name;
        self.user = info.user;
        self.password = info.password;
        self.source = info.source;
        self.profiles = Some(info.profiles);
    }

    pub fn touch(&mut self) {
        self.last_seen = now_secs();
        self.alive = true;
    }
}

#[derive(Default)]
struct Table {
    by_key: HashMap<(String, u16), Camera>,
}

/// The registry, guarded by a single lock: all mutations go through it so readers see
/// consistent snapshots.
#[derive(Default)]
pub struct CameraRegistry {
    table: Mutex<Table>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn find_by_ip(&self, ip: &str) -> Option<Camera> {
        self.table
            .lock()
            .await
            .by_key
            .values()
            .find(|c| c.ip == ip)
            .cloned()
    }

    pub async fn find_by_name(&self, name: &str) -> Vec<Camera> {
        self.table
            .lock()
            .await
            .by_key
            .values()
            .filter(|c| c.id == name)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Camera> {
        self.table.lock().await.by_key.values().cloned().collect()
    }

    /// Insert a new record. Returns `false` without mutating if `(ip, port)` already exists
    /// — callers that want refresh semantics should use `upsert`.
    pub async fn insert(&self, camera: Camera) -> bool {
        let mut table = self.table.lock().await;
        let key = (camera.ip.clone(), camera.port);
        if table.by_key.contains_key(&key) {
            return false;
        }
        table.by_key.insert(key, camera);
        true
    }

    /// Insert or replace, returning `true` if this was a new `(ip, port)`.
    pub async fn upsert(&self, camera: Camera) -> bool {
        let mut table = self.table.lock().await;
        let key = (camera.ip.clone(), camera.port);
        table.by_key.insert(key, camera).is_none()
    }

    pub async fn remove(&self, ip: &str, port: u16) -> Option<Camera> {
        self.table.lock().await.by_key.remove(&(ip.to_string(), port))
    }

    pub async fn clear(&self) {
        self.table.lock().await.by_key.clear();
    }

    /// Mutate the record for `(ip, port)` in place under the registry lock, returning
    /// whether a record existed.
    pub async fn with_mut<F>(&self, ip: &str, port: u16, f: F) -> bool
    where
        F: FnOnce(&mut Camera),
    {
        let mut table = self.table.lock().await;
        match table.by_key.get_mut(&(ip.to_string(), port)) {
            Some(camera) => {
                f(camera);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_ip_port_insert_is_rejected() {
        let registry = CameraRegistry::new();
        assert!(registry.insert(Camera::new("10.0.0.5", 80, "http://10.0.0.5/onvif/device_service")).await);
        assert!(!registry.insert(Camera::new("10.0.0.5", 80, "http://10.0.0.5/onvif/device_service")).await);
        assert_eq!(registry.all().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_ports_are_distinct_records() {
        let registry = CameraRegistry::new();
        registry.insert(Camera::new("10.0.0.5", 80, "u1")).await;
        registry.insert(Camera::new("10.0.0.5", 8080, "u2")).await;
        assert_eq!(registry.all().await.len(), 2);
    }

    #[tokio::test]
    async fn profiles_none_is_distinct_from_empty() {
        let mut camera = Camera::new("10.0.0.5", 80, "u");
        assert!(camera.profiles.is_none());
        camera.profiles = Some(Vec::new());
        assert_eq!(camera.profiles, Some(Vec::new()));
    }
}
