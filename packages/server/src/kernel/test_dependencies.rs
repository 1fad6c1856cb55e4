// TestDependencies - mock implementations for testing
//
// Provides in-process stand-ins that can be injected into ServerKernel for
// tests: a full in-memory KvStore, a programmable provider client, and a spy
// webhook sender. Used by unit tests and the integration suites; no Redis or
// network required.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use novita_client::{
    CreateInstanceRequest, CreateInstanceResponse, InstanceData, ListInstancesResponse,
    MigrateResponse, NovitaError, Product, ProductFilters, RegistryAuth, Template,
};

use super::kv_store::{KvStore, PipelineCommand, PipelineReply, PipelineResult};
use super::traits::{BaseProviderClient, BaseWebhookSender};
use crate::common::WebhookPayload;

// =============================================================================
// In-memory KvStore
// =============================================================================

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, (Vec<u8>, Option<DateTime<Utc>>)>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

impl MemoryState {
    /// Lazily drop an expired string key.
    fn purge(&mut self, key: &str) {
        if let Some((_, Some(expires_at))) = self.strings.get(key) {
            if *expires_at <= Utc::now() {
                self.strings.remove(key);
            }
        }
    }

    fn sorted_members(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        // Redis orders by score, then lexicographically by member.
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        members
    }
}

/// Full in-memory [`KvStore`] with TTL, sorted sets, scan, and pipelining.
#[derive(Default)]
pub struct MemoryKvStore {
    state: Mutex<MemoryState>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Minimal glob matcher supporting `*` wildcards (what SCAN patterns use).
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == parts.len() - 1 {
            return text.len() >= pos + part.len() && text[pos..].ends_with(part);
        } else {
            match text[pos..].find(part) {
                Some(idx) => pos += idx + part.len(),
                None => return false,
            }
        }
    }
    true
}

fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let n = len as isize;
    if n == 0 {
        return None;
    }
    let mut s = if start < 0 { n + start } else { start };
    let mut e = if stop < 0 { n + stop } else { stop };
    if s < 0 {
        s = 0;
    }
    if e >= n {
        e = n - 1;
    }
    if s > e {
        return None;
    }
    Some((s as usize, e as usize))
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        state.purge(key);
        Ok(state.strings.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Utc::now() + chrono::Duration::from_std(ttl).unwrap());
        self.state
            .lock()
            .unwrap()
            .strings
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.purge(key);
        let existed = state.strings.remove(key).is_some()
            | state.hashes.remove(key).is_some()
            | state.zsets.remove(key).is_some();
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.purge(key);
        Ok(state.strings.contains_key(key)
            || state.hashes.contains_key(key)
            || state.zsets.contains_key(key))
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.purge(key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap();
        state
            .strings
            .insert(key.to_string(), (value, Some(expires_at)));
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.purge(key);
        if let Some(entry) = state.strings.get_mut(key) {
            entry.1 = Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap());
            return Ok(true);
        }
        Ok(false)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut state = self.state.lock().unwrap();
        state.purge(key);
        let remaining = state.strings.get(key).and_then(|(_, expires_at)| {
            expires_at.map(|at| {
                at.signed_duration_since(Utc::now())
                    .to_std()
                    .unwrap_or_default()
            })
        });
        Ok(remaining)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let hash = state.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value);
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .hashes
            .get_mut(key)
            .map(|hash| hash.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .map(|hash| hash.len() as u64)
            .unwrap_or(0))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .zsets
            .get_mut(key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut members = state.sorted_members(key);
        members.reverse();
        let Some((s, e)) = resolve_range(members.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(members[s..=e].iter().map(|(m, _)| m.clone()).collect())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sorted_members(key)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .zsets
            .get(key)
            .map(|set| set.len() as u64)
            .unwrap_or(0))
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let Some(set) = state.zsets.get_mut(key) else {
            return Ok(0);
        };
        let victims: Vec<String> = set
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, _)| member.clone())
            .collect();
        for member in &victims {
            set.remove(member);
        }
        Ok(victims.len() as u64)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .zsets
            .get(key)
            .and_then(|set| set.get(member).copied()))
    }

    async fn scan(
        &self,
        _cursor: u64,
        pattern: &str,
        _count: usize,
    ) -> Result<(u64, Vec<String>)> {
        // Single-shot scan: everything in one page, cursor exhausted.
        let mut state = self.state.lock().unwrap();
        let expired: Vec<String> = state
            .strings
            .iter()
            .filter(|(_, (_, expires_at))| expires_at.map(|at| at <= Utc::now()).unwrap_or(false))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.strings.remove(&key);
        }

        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.hashes.keys())
            .chain(state.zsets.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok((0, keys))
    }

    async fn pipeline(&self, commands: Vec<PipelineCommand>) -> Result<Vec<PipelineResult>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result: PipelineResult = match command {
                PipelineCommand::Get { key } => self
                    .get(&key)
                    .await
                    .map(PipelineReply::Value)
                    .map_err(|e| e.to_string()),
                PipelineCommand::Set { key, value, ttl } => self
                    .set(&key, value, ttl)
                    .await
                    .map(|_| PipelineReply::Unit)
                    .map_err(|e| e.to_string()),
                PipelineCommand::Del { key } => self
                    .del(&key)
                    .await
                    .map(PipelineReply::Bool)
                    .map_err(|e| e.to_string()),
                PipelineCommand::Exists { key } => self
                    .exists(&key)
                    .await
                    .map(PipelineReply::Bool)
                    .map_err(|e| e.to_string()),
            };
            results.push(result);
        }
        Ok(results)
    }
}

// =============================================================================
// Mock provider client
// =============================================================================

#[derive(Default)]
struct MockProviderState {
    products: Vec<Product>,
    templates: HashMap<String, Template>,
    registry_auths: HashMap<String, RegistryAuth>,
    instances: Vec<InstanceData>,
    /// Per-instance status progression consumed by `get_instance`; the final
    /// status repeats once the sequence is exhausted.
    status_sequences: HashMap<String, VecDeque<String>>,
    migrate_errors: HashMap<String, VecDeque<NovitaError>>,
    create_error: Option<NovitaError>,
    list_error: Option<NovitaError>,
    next_id: u64,
    created: Vec<CreateInstanceRequest>,
    stopped: Vec<String>,
    migrated: Vec<String>,
}

/// Programmable provider client recording every mutating call.
#[derive(Default)]
pub struct MockProviderClient {
    state: Mutex<MockProviderState>,
}

impl MockProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&self, product: Product) {
        self.state.lock().unwrap().products.push(product);
    }

    pub fn add_template(&self, template: Template) {
        self.state
            .lock()
            .unwrap()
            .templates
            .insert(template.id.clone(), template);
    }

    pub fn add_registry_auth(&self, auth_id: &str, auth: RegistryAuth) {
        self.state
            .lock()
            .unwrap()
            .registry_auths
            .insert(auth_id.to_string(), auth);
    }

    pub fn add_instance(&self, instance: InstanceData) {
        self.state.lock().unwrap().instances.push(instance);
    }

    /// Program the statuses `get_instance` reports for one instance, in order.
    pub fn set_status_sequence(&self, instance_id: &str, statuses: &[&str]) {
        self.state.lock().unwrap().status_sequences.insert(
            instance_id.to_string(),
            statuses.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn queue_migrate_error(&self, instance_id: &str, error: NovitaError) {
        self.state
            .lock()
            .unwrap()
            .migrate_errors
            .entry(instance_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_create_error(&self, error: NovitaError) {
        self.state.lock().unwrap().create_error = Some(error);
    }

    pub fn set_list_error(&self, error: NovitaError) {
        self.state.lock().unwrap().list_error = Some(error);
    }

    pub fn update_instance_status(&self, instance_id: &str, status: &str) {
        let mut state = self.state.lock().unwrap();
        for instance in &mut state.instances {
            if instance.id == instance_id {
                instance.status = status.to_string();
            }
        }
    }

    pub fn created_requests(&self) -> Vec<CreateInstanceRequest> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn stopped_instances(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn migrated_instances(&self) -> Vec<String> {
        self.state.lock().unwrap().migrated.clone()
    }
}

#[async_trait]
impl BaseProviderClient for MockProviderClient {
    async fn list_products(&self, filters: &ProductFilters) -> novita_client::Result<Vec<Product>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .products
            .iter()
            .filter(|p| {
                filters
                    .product_name
                    .as_ref()
                    .map(|name| &p.name == name)
                    .unwrap_or(true)
                    && filters
                        .region
                        .as_ref()
                        .map(|region| &p.region == region)
                        .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn get_template(&self, template_id: &str) -> novita_client::Result<Template> {
        self.state
            .lock()
            .unwrap()
            .templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| NovitaError::NotFound(format!("template {}", template_id)))
    }

    async fn get_registry_auth(&self, auth_id: &str) -> novita_client::Result<RegistryAuth> {
        self.state
            .lock()
            .unwrap()
            .registry_auths
            .get(auth_id)
            .cloned()
            .ok_or_else(|| NovitaError::NotFound(format!("registry auth {}", auth_id)))
    }

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> novita_client::Result<CreateInstanceResponse> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.create_error.take() {
            return Err(error);
        }
        state.next_id += 1;
        let id = format!("nov-{}", state.next_id);
        state.created.push(request.clone());
        state.instances.push(InstanceData {
            id: id.clone(),
            name: request.name.clone(),
            status: "creating".to_string(),
            gpu_ids: None,
            spot_status: None,
            spot_reclaim_time: None,
        });
        Ok(CreateInstanceResponse { id })
    }

    async fn get_instance(&self, instance_id: &str) -> novita_client::Result<InstanceData> {
        let mut state = self.state.lock().unwrap();
        let next_status = state.status_sequences.get_mut(instance_id).map(|seq| {
            if seq.len() > 1 {
                seq.pop_front().unwrap()
            } else {
                seq.front().cloned().unwrap_or_default()
            }
        });

        let found = state
            .instances
            .iter()
            .find(|instance| instance.id == instance_id)
            .cloned();

        match (found, next_status) {
            (Some(mut instance), Some(status)) => {
                instance.status = status;
                Ok(instance)
            }
            (Some(instance), None) => Ok(instance),
            (None, Some(status)) => Ok(InstanceData {
                id: instance_id.to_string(),
                name: String::new(),
                status,
                gpu_ids: None,
                spot_status: None,
                spot_reclaim_time: None,
            }),
            (None, None) => Err(NovitaError::NotFound(format!("instance {}", instance_id))),
        }
    }

    async fn start_instance(&self, _instance_id: &str) -> novita_client::Result<()> {
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> novita_client::Result<()> {
        self.state
            .lock()
            .unwrap()
            .stopped
            .push(instance_id.to_string());
        Ok(())
    }

    async fn delete_instance(&self, _instance_id: &str) -> novita_client::Result<()> {
        Ok(())
    }

    async fn list_instances(
        &self,
        page: i64,
        page_size: i64,
        status: Option<&str>,
    ) -> novita_client::Result<ListInstancesResponse> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.list_error.take() {
            return Err(error);
        }
        let filtered: Vec<InstanceData> = state
            .instances
            .iter()
            .filter(|instance| status.map(|s| instance.status == s).unwrap_or(true))
            .cloned()
            .collect();
        let total = filtered.len() as i64;
        let start = ((page - 1).max(0) * page_size) as usize;
        let instances = filtered
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();
        Ok(ListInstancesResponse { instances, total })
    }

    async fn migrate_instance(&self, instance_id: &str) -> novita_client::Result<MigrateResponse> {
        let mut state = self.state.lock().unwrap();
        if let Some(errors) = state.migrate_errors.get_mut(instance_id) {
            if let Some(error) = errors.pop_front() {
                return Err(error);
            }
        }
        state.migrated.push(instance_id.to_string());
        Ok(MigrateResponse {
            new_instance_id: Some(format!("{}-new", instance_id)),
            message: Some("migration started".to_string()),
            error: None,
        })
    }
}

// =============================================================================
// Spy webhook sender
// =============================================================================

/// A webhook delivery recorded by the spy.
#[derive(Debug, Clone)]
pub struct SentWebhook {
    pub url: String,
    pub payload: WebhookPayload,
}

/// Records webhook deliveries; can be told to fail the next N sends.
#[derive(Default)]
pub struct SpyWebhookSender {
    sent: Mutex<Vec<SentWebhook>>,
    fail_next: AtomicU32,
}

impl SpyWebhookSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: u32) {
        self.fail_next.store(times, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentWebhook> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_statuses(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|webhook| webhook.payload.status.clone())
            .collect()
    }
}

#[async_trait]
impl BaseWebhookSender for SpyWebhookSender {
    async fn send(
        &self,
        url: &str,
        payload: &WebhookPayload,
        _headers: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            bail!("simulated webhook delivery failure");
        }
        self.sent.lock().unwrap().push(SentWebhook {
            url: url.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("jobs:data:*", "jobs:data:job_1"));
        assert!(glob_match("jobs:data:job_*", "jobs:data:job_1"));
        assert!(!glob_match("jobs:data:job_*", "jobs:data:other"));
        assert!(glob_match("cache:instances:*", "cache:instances:inst_1"));
        assert!(!glob_match("cache:instances:*", "cache:products:p1"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_memory_store_ttl() {
        let store = MemoryKvStore::new();
        store
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_set_nx() {
        let store = MemoryKvStore::new();
        assert!(store
            .set_nx("lock", b"a".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .set_nx("lock", b"b".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_expire_and_ttl() {
        let store = MemoryKvStore::new();
        store.set("k", b"v".to_vec(), None).await.unwrap();
        assert!(store.ttl("k").await.unwrap().is_none());

        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());
        let remaining = store.ttl("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));

        assert!(!store.expire("missing", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_zrem_range_by_score() {
        let store = MemoryKvStore::new();
        store.zadd("z", 1.0, "a").await.unwrap();
        store.zadd("z", 2.0, "b").await.unwrap();
        store.zadd("z", 3.0, "c").await.unwrap();

        assert_eq!(store.zrem_range_by_score("z", 1.0, 2.0).await.unwrap(), 2);
        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert_eq!(store.zrevrange("z", 0, -1).await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_memory_store_zset_ordering() {
        let store = MemoryKvStore::new();
        store.zadd("z", 1.0, "low").await.unwrap();
        store.zadd("z", 3.0, "high").await.unwrap();
        store.zadd("z", 2.0, "mid").await.unwrap();

        assert_eq!(store.zrevrange("z", 0, 0).await.unwrap(), vec!["high"]);
        assert_eq!(
            store.zrevrange("z", 0, -1).await.unwrap(),
            vec!["high", "mid", "low"]
        );
        assert_eq!(
            store.zrange_by_score("z", 1.0, 2.0).await.unwrap(),
            vec!["low", "mid"]
        );
    }
}
