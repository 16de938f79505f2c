//! Optional result cache for engine calls.
//!
//! Keys are SHA-256 digests of the normalized request, the simulation
//! settings and a digest of the reference tables and site registry the
//! engine computes from. Two spellings of the same site or SSP share an
//! entry; engines built over different data never do.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::engine::SimulationSettings;
use crate::model::{ScenarioRequest, ScenarioResponse, Ssp};
use crate::reference::ReferenceTables;
use crate::sites::SiteRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// `context` is the [`context_digest`] of the engine's data.
    pub fn for_request(
        request: &ScenarioRequest,
        settings: &SimulationSettings,
        context: &str,
    ) -> Self {
        let normalized = normalize(request);
        let mut hasher = Sha256::new();
        hasher.update(context.as_bytes());
        hasher.update(serde_json::to_vec(&(&normalized, settings)).unwrap_or_default());
        Self(to_hex(&hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Content digest of the reference tables and site registry.
pub fn context_digest(tables: &ReferenceTables, sites: &SiteRegistry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{:?}", tables).as_bytes());
    hasher.update(serde_json::to_vec(sites.sites()).unwrap_or_default());
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn normalize(request: &ScenarioRequest) -> ScenarioRequest {
    let mut r = request.clone();
    r.site_scope = r
        .site_scope
        .iter()
        .map(|s| {
            s.trim()
                .to_lowercase()
                .chars()
                .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
                .collect()
        })
        .collect();
    if let Some(Ok(ssp)) = r.ssp_scenario.as_deref().map(str::parse::<Ssp>) {
        r.ssp_scenario = Some(ssp.label().to_string());
    }
    r
}

pub trait SimulationCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<ScenarioResponse>;
    fn put(&self, key: CacheKey, response: &ScenarioResponse);
}

/// Cache that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl SimulationCache for NoCache {
    fn get(&self, _key: &CacheKey) -> Option<ScenarioResponse> {
        None
    }

    fn put(&self, _key: CacheKey, _response: &ScenarioResponse) {}
}

struct Entry {
    response: ScenarioResponse,
    inserted: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    order: VecDeque<CacheKey>,
}

/// Bounded in-process cache with first-in first-out eviction and an
/// optional time-to-live.
pub struct MemoryCache {
    capacity: usize,
    ttl: Option<Duration>,
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, entry: &Entry) -> bool {
        self.ttl.is_some_and(|ttl| entry.inserted.elapsed() > ttl)
    }
}

impl SimulationCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<ScenarioResponse> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            None => return None,
            Some(e) if !self.expired(e) => return Some(e.response.clone()),
            Some(_) => {}
        }
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
        None
    }

    fn put(&self, key: CacheKey, response: &ScenarioResponse) {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        }
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            Entry {
                response: response.clone(),
                inserted: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScenarioError;
    use crate::model::ScenarioType;

    const CTX: &str = "ctx";

    fn response(req: &ScenarioRequest) -> ScenarioResponse {
        ScenarioResponse::fail_closed(req.clone(), &ScenarioError::invalid("x"))
    }

    #[test]
    fn spelling_variants_share_a_key() {
        let s = SimulationSettings::default();
        let a = ScenarioRequest::climate("Cabo Pulmo", "ssp245", 2050);
        let b = ScenarioRequest::climate("cabo_pulmo", "SSP2-4.5", 2050);
        assert_eq!(CacheKey::for_request(&a, &s, CTX), CacheKey::for_request(&b, &s, CTX));
        let c = ScenarioRequest::climate("cabo_pulmo", "SSP2-4.5", 2051);
        assert_ne!(CacheKey::for_request(&a, &s, CTX), CacheKey::for_request(&c, &s, CTX));
        let other_seed = SimulationSettings { seed: 7, ..s };
        assert_ne!(CacheKey::for_request(&a, &s, CTX), CacheKey::for_request(&a, &other_seed, CTX));
        assert_eq!(CacheKey::for_request(&a, &s, CTX).as_str().len(), 64);
    }

    #[test]
    fn context_digest_tracks_tables_and_sites() {
        let tables = ReferenceTables::builtin();
        let sites = SiteRegistry::default();
        let base = context_digest(&tables, &sites);
        assert_eq!(base, context_digest(&ReferenceTables::builtin(), &sites));

        let mut repriced = ReferenceTables::builtin();
        repriced.carbon_prices.insert("conservative".into(), 65.0);
        assert_ne!(base, context_digest(&repriced, &sites));

        let one_site =
            SiteRegistry::from_sites(vec![crate::sites::SiteData::new("a", "coral_reef")]).unwrap();
        assert_ne!(base, context_digest(&tables, &one_site));

        let r = ScenarioRequest::new(ScenarioType::Market, &["a"]);
        let s = SimulationSettings::default();
        assert_ne!(
            CacheKey::for_request(&r, &s, &base),
            CacheKey::for_request(&r, &s, &context_digest(&repriced, &sites))
        );
    }

    #[test]
    fn memory_cache_evicts_oldest() {
        let cache = MemoryCache::new(2, None);
        let s = SimulationSettings::default();
        let reqs: Vec<ScenarioRequest> = ["a", "b", "c"]
            .iter()
            .map(|site| ScenarioRequest::new(ScenarioType::Counterfactual, &[*site]))
            .collect();
        for r in &reqs {
            cache.put(CacheKey::for_request(r, &s, CTX), &response(r));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&CacheKey::for_request(&reqs[0], &s, CTX)).is_none());
        assert!(cache.get(&CacheKey::for_request(&reqs[2], &s, CTX)).is_some());
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = MemoryCache::new(4, Some(Duration::ZERO));
        let r = ScenarioRequest::new(ScenarioType::Counterfactual, &["a"]);
        let key = CacheKey::for_request(&r, &SimulationSettings::default(), CTX);
        cache.put(key.clone(), &response(&r));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn no_cache_stores_nothing() {
        let r = ScenarioRequest::new(ScenarioType::Counterfactual, &["a"]);
        let key = CacheKey::for_request(&r, &SimulationSettings::default(), CTX);
        NoCache.put(key.clone(), &response(&r));
        assert!(NoCache.get(&key).is_none());
    }
}
