use crate::context::lock_unpoisoned;
use crate::models::{EnvTarget, ProviderKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Snapshot {
    fetched_at: Instant,
    values: BTreeMap<String, String>,
}

/// Short-lived remote env snapshots keyed by provider and target.
#[derive(Debug)]
pub struct RemoteEnvCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Snapshot>>,
}

/// `provider:env:target`, suffixed with the project when one is known so
/// projects sharing a provider in one run keep separate snapshots.
pub fn cache_key(provider: ProviderKind, target: EnvTarget, project: Option<&str>) -> String {
    match project {
        Some(project) => format!("{}:env:{}:{}", provider.as_str(), target.as_str(), project),
        None => format!("{}:env:{}", provider.as_str(), target.as_str()),
    }
}

impl RemoteEnvCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<BTreeMap<String, String>> {
        let mut entries = lock_unpoisoned(&self.entries);
        let fresh = entries
            .get(key)
            .map(|snapshot| snapshot.fetched_at.elapsed() < self.ttl)?;
        if !fresh {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|snapshot| snapshot.values.clone())
    }

    pub fn put(&self, key: &str, values: BTreeMap<String, String>) {
        lock_unpoisoned(&self.entries).insert(
            key.to_string(),
            Snapshot {
                fetched_at: Instant::now(),
                values,
            },
        );
    }

    /// Reflects a completed write so later lookups in the same run see it.
    pub fn record_write(&self, key: &str, name: &str, value: &str) {
        if let Some(snapshot) = lock_unpoisoned(&self.entries).get_mut(key) {
            snapshot.values.insert(name.to_string(), value.to_string());
        }
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{cache_key, RemoteEnvCache};
    use crate::models::{EnvTarget, ProviderKind};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn key_combines_provider_and_target() {
        assert_eq!(cache_key(ProviderKind::Vercel, EnvTarget::Preview, None), "vercel:env:preview");
        assert_eq!(
            cache_key(ProviderKind::Noop, EnvTarget::Production, Some("web")),
            "noop:env:production:web"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = RemoteEnvCache::new(Duration::from_secs(60));
        let mut values = BTreeMap::new();
        values.insert("K".to_string(), "v".to_string());
        cache.put("vercel:env:preview", values);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.get("vercel:env:preview").is_some());
        cache.record_write("vercel:env:preview", "K", "v2");
        assert_eq!(
            cache.get("vercel:env:preview").and_then(|v| v.get("K").cloned()).as_deref(),
            Some("v2")
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("vercel:env:preview").is_none());
    }
}
