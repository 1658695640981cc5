//! Strategy executors: the caching disciplines run against one namespace.

use chrono::{Duration, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{cache_key, CacheEntry, CacheSource};
use crate::http::{Request, Response};
use crate::network::Network;

/// A response together with where it came from and any refresh still
/// running on its behalf.
#[derive(Debug)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
  /// Background revalidation that must be allowed to finish even though the
  /// response has already been handed out
  pub revalidation: Option<Revalidation>,
}

impl Served {
  pub fn new(response: Response, source: CacheSource) -> Self {
    Self {
      response,
      source,
      revalidation: None,
    }
  }

  fn with_revalidation(mut self, handle: JoinHandle<()>) -> Self {
    self.revalidation = Some(Revalidation { handle });
    self
  }

  /// Wait for the background refresh, if any.
  pub async fn settle(self) -> Response {
    if let Some(revalidation) = self.revalidation {
      revalidation.settled().await;
    }
    self.response
  }
}

/// Handle to a background cache refresh.
#[derive(Debug)]
pub struct Revalidation {
  handle: JoinHandle<()>,
}

impl Revalidation {
  /// Resolve once the refresh has written (or given up on) its entry.
  pub async fn settled(self) {
    if let Err(e) = self.handle.await {
      warn!("Background revalidation aborted: {}", e);
    }
  }
}

/// Cache layer that runs the caching strategies.
///
/// This layer sits between the router and the network client. Cache-store
/// failures never reach the caller: a failed read is a miss and a failed
/// write is skipped.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<S>, network: Arc<dyn Network>) -> Self {
    Self { storage, network }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Cache-first for immutable assets.
  ///
  /// 1. Serve from cache if present, no freshness check
  /// 2. Otherwise fetch, storing 2xx responses
  /// 3. On network failure, synthetic 503
  pub async fn cache_first(&self, namespace: &str, request: Request) -> Served {
    self.cache_first_with(namespace, request, None).await
  }

  /// Cache-first with an upper bound on the namespace size. Inserting into a
  /// full namespace evicts the oldest-inserted entry first.
  pub async fn bounded_cache_first(
    &self,
    namespace: &str,
    request: Request,
    max_entries: usize,
  ) -> Served {
    self
      .cache_first_with(namespace, request, Some(max_entries))
      .await
  }

  async fn cache_first_with(
    &self,
    namespace: &str,
    request: Request,
    max_entries: Option<usize>,
  ) -> Served {
    let key = cache_key(&request.method, &request.url);
    if let Some(cached) = self.lookup(namespace, &key) {
      return Served::new(cached.response, CacheSource::CacheFresh);
    }

    match self.network.fetch(request.clone()).await {
      Ok(response) => {
        if response.is_success() {
          let entry = CacheEntry::new(&request, response.clone());
          match max_entries {
            Some(max) => store_bounded(self.storage.as_ref(), namespace, &entry, max),
            None => store(self.storage.as_ref(), namespace, &entry),
          }
        }
        Served::new(response, CacheSource::Network)
      }
      Err(e) => {
        debug!("Cache miss and network failure for {}: {}", request.url, e);
        Served::new(Response::service_unavailable(), CacheSource::Unavailable)
      }
    }
  }

  /// Stale-while-revalidate bounded by a TTL.
  ///
  /// Within the TTL the cached entry is returned at once and refreshed in the
  /// background. Past the TTL (or with no entry) the network is consulted
  /// first, falling back to the stale entry, then to a 503.
  pub async fn ttl_revalidate(&self, namespace: &str, request: Request, ttl: Duration) -> Served {
    let key = cache_key(&request.method, &request.url);
    let cached = self.lookup(namespace, &key);

    if let Some(cached) = &cached {
      if Utc::now() - cached.freshness() <= ttl {
        let handle = self.spawn_refresh(namespace, request, RefreshRule::SuccessOnly);
        return Served::new(cached.response.clone(), CacheSource::CacheFresh)
          .with_revalidation(handle);
      }
    }

    match self.network.fetch(request.clone()).await {
      Ok(response) => {
        if response.is_success() {
          let entry = CacheEntry::new(&request, response.clone()).validated();
          store(self.storage.as_ref(), namespace, &entry);
        }
        Served::new(response, CacheSource::Network)
      }
      Err(e) => match cached {
        Some(stale) => {
          debug!("Serving stale {} after network failure: {}", request.url, e);
          Served::new(stale.response, CacheSource::CacheStale)
        }
        None => Served::new(Response::service_unavailable(), CacheSource::Unavailable),
      },
    }
  }

  /// Unbounded stale-while-revalidate for navigations.
  ///
  /// A cached page is returned immediately while the network refresh runs
  /// on. Without one, the network result is awaited; if that fails the
  /// entry under `fallback_key` (the offline page) is served.
  pub async fn stale_while_revalidate(
    &self,
    namespace: &str,
    request: Request,
    fallback_key: Option<&str>,
  ) -> Served {
    let key = cache_key(&request.method, &request.url);

    if let Some(cached) = self.lookup(namespace, &key) {
      let handle = self.spawn_refresh(namespace, request, RefreshRule::Cacheable);
      return Served::new(cached.response, CacheSource::CacheStale).with_revalidation(handle);
    }

    match self.network.fetch(request.clone()).await {
      Ok(response) => {
        if response.is_success() && !response.is_no_store() {
          store(
            self.storage.as_ref(),
            namespace,
            &CacheEntry::new(&request, response.clone()),
          );
        }
        Served::new(response, CacheSource::Network)
      }
      Err(e) => {
        debug!("Navigation to {} failed: {}", request.url, e);
        fallback_key
          .and_then(|k| self.lookup(namespace, k))
          .map(|page| Served::new(page.response, CacheSource::Offline))
          .unwrap_or_else(|| {
            Served::new(Response::service_unavailable(), CacheSource::Unavailable)
          })
      }
    }
  }

  /// Straight to the network; connectivity failures reach the caller.
  pub async fn network_only(&self, request: Request) -> Result<Response> {
    self.network.fetch(request).await
  }

  /// Fetch `request` and store it unconditionally on success. Used to
  /// precache pages at install time.
  pub async fn precache(&self, namespace: &str, request: Request) -> Result<Response> {
    let response = self.network.fetch(request.clone()).await?;
    if response.is_success() {
      self
        .storage
        .put(namespace, &CacheEntry::new(&request, response.clone()))?;
    }
    Ok(response)
  }

  fn lookup(&self, namespace: &str, key: &str) -> Option<CacheEntry> {
    match self.storage.get(namespace, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!("Cache read from {} failed, treating as miss: {}", namespace, e);
        None
      }
    }
  }

  fn spawn_refresh(&self, namespace: &str, request: Request, rule: RefreshRule) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let namespace = namespace.to_string();

    tokio::spawn(async move {
      match network.fetch(request.clone()).await {
        Ok(response) if rule.should_store(&response) => {
          let entry = CacheEntry::new(&request, response);
          let entry = match rule {
            RefreshRule::SuccessOnly => entry.validated(),
            RefreshRule::Cacheable => entry,
          };
          store(storage.as_ref(), &namespace, &entry);
          debug!("Revalidated {} in {}", request.url, namespace);
        }
        Ok(response) => {
          debug!(
            "Revalidation of {} returned {}, keeping cached copy",
            request.url, response.status
          );
        }
        Err(e) => debug!("Revalidation of {} failed: {}", request.url, e),
      }
    })
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
    }
  }
}

/// Which refreshed responses overwrite the cache.
#[derive(Debug, Clone, Copy)]
enum RefreshRule {
  /// Any 2xx; the entry records a new validation time
  SuccessOnly,
  /// 2xx that does not declare itself non-cacheable
  Cacheable,
}

impl RefreshRule {
  fn should_store(&self, response: &Response) -> bool {
    match self {
      Self::SuccessOnly => response.is_success(),
      Self::Cacheable => response.is_success() && !response.is_no_store(),
    }
  }
}

fn store<S: CacheStorage + ?Sized>(storage: &S, namespace: &str, entry: &CacheEntry) {
  if let Err(e) = storage.put(namespace, entry) {
    warn!("Cache write to {} failed, skipping: {}", namespace, e);
  }
}

fn store_bounded<S: CacheStorage + ?Sized>(
  storage: &S,
  namespace: &str,
  entry: &CacheEntry,
  max_entries: usize,
) {
  match storage.put_bounded(namespace, entry, max_entries) {
    Ok(evicted) if !evicted.is_empty() => {
      debug!("Evicted {} entries from {}", evicted.len(), namespace);
    }
    Ok(_) => {}
    Err(e) => warn!("Cache write to {} failed, skipping: {}", namespace, e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::network::testing::ScriptedNetwork;
  use url::Url;

  const NS: &str = "test-ns";

  fn layer(network: &ScriptedNetwork) -> CacheLayer<SqliteStorage> {
    let storage = Arc::new(SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap())));
    CacheLayer::new(storage, Arc::new(network.clone()))
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse(&format!("https://app.example.com{}", path)).unwrap())
  }

  fn put_aged(layer: &CacheLayer<SqliteStorage>, path: &str, body: &str, age: Duration) {
    let mut entry = CacheEntry::new(&get(path), Response::new(200, body)).validated();
    entry.inserted_at = Utc::now() - age;
    entry.validated_at = Some(entry.inserted_at);
    layer.storage().put(NS, &entry).unwrap();
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let network = ScriptedNetwork::new();
    network.respond("/_next/static/app.js", Response::new(200, "v1"));
    let layer = layer(&network);

    let first = layer.cache_first(NS, get("/_next/static/app.js")).await;
    assert_eq!(first.source, CacheSource::Network);

    network.respond("/_next/static/app.js", Response::new(200, "v2"));
    let second = layer.cache_first(NS, get("/_next/static/app.js")).await;
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.response.body, b"v1");
    assert_eq!(network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_offline_miss_is_503() {
    let network = ScriptedNetwork::new();
    let layer = layer(&network);

    let served = layer.cache_first(NS, get("/_next/static/app.js")).await;
    assert_eq!(served.response.status, 503);
    assert!(served.response.body.is_empty());
    assert_eq!(served.source, CacheSource::Unavailable);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let network = ScriptedNetwork::new();
    network.respond("/images/missing.png", Response::new(404, "nope"));
    let layer = layer(&network);

    let served = layer
      .bounded_cache_first(NS, get("/images/missing.png"), 2)
      .await;
    assert_eq!(served.response.status, 404);
    assert_eq!(layer.storage().len(NS).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_bounded_image_namespace_keeps_newest() {
    let network = ScriptedNetwork::new();
    for path in ["/images/k1.png", "/images/k2.png", "/images/k3.png"] {
      network.respond(path, Response::new(200, path));
    }
    let layer = layer(&network);

    for path in ["/images/k1.png", "/images/k2.png", "/images/k3.png"] {
      layer.bounded_cache_first(NS, get(path), 2).await;
    }

    let k2 = cache_key(&reqwest::Method::GET, &get("/images/k2.png").url);
    let k3 = cache_key(&reqwest::Method::GET, &get("/images/k3.png").url);
    assert_eq!(layer.storage().keys(NS).unwrap(), vec![k2, k3]);
  }

  #[tokio::test]
  async fn test_ttl_within_window_serves_cache_and_refreshes() {
    let network = ScriptedNetwork::new();
    network.respond("/api/subjects", Response::new(200, "new"));
    let layer = layer(&network);
    put_aged(&layer, "/api/subjects", "old", Duration::minutes(5) - Duration::seconds(5));

    let served = layer
      .ttl_revalidate(NS, get("/api/subjects"), Duration::minutes(5))
      .await;
    assert_eq!(served.source, CacheSource::CacheFresh);
    assert_eq!(served.response.body, b"old");

    served.settle().await;
    assert_eq!(network.calls_to("/api/subjects"), 1);

    let key = cache_key(&reqwest::Method::GET, &get("/api/subjects").url);
    let refreshed = layer.storage().get(NS, &key).unwrap().unwrap();
    assert_eq!(refreshed.response.body, b"new");
    assert!(Utc::now() - refreshed.freshness() < Duration::seconds(5));
  }

  #[tokio::test]
  async fn test_ttl_expired_fetches_synchronously() {
    let network = ScriptedNetwork::new();
    network.respond("/api/subjects", Response::new(200, "new"));
    let layer = layer(&network);
    put_aged(&layer, "/api/subjects", "old", Duration::minutes(5) + Duration::seconds(5));

    let served = layer
      .ttl_revalidate(NS, get("/api/subjects"), Duration::minutes(5))
      .await;
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.body, b"new");
    assert!(served.revalidation.is_none());
  }

  #[tokio::test]
  async fn test_ttl_expired_offline_serves_stale() {
    let network = ScriptedNetwork::new();
    let layer = layer(&network);
    put_aged(&layer, "/api/subjects", "old", Duration::hours(1));

    let served = layer
      .ttl_revalidate(NS, get("/api/subjects"), Duration::minutes(5))
      .await;
    assert_eq!(served.source, CacheSource::CacheStale);
    assert_eq!(served.response.body, b"old");

    let missing = layer
      .ttl_revalidate(NS, get("/api/exams"), Duration::minutes(5))
      .await;
    assert_eq!(missing.response.status, 503);
  }

  #[tokio::test]
  async fn test_ttl_http_error_is_returned_not_stale() {
    let network = ScriptedNetwork::new();
    network.respond("/api/subjects", Response::new(500, "boom"));
    let layer = layer(&network);
    put_aged(&layer, "/api/subjects", "old", Duration::hours(1));

    let served = layer
      .ttl_revalidate(NS, get("/api/subjects"), Duration::minutes(5))
      .await;
    assert_eq!(served.response.status, 500);
  }

  #[tokio::test]
  async fn test_navigation_serves_cache_and_refresh_outlives_response() {
    let network = ScriptedNetwork::new().with_delay(std::time::Duration::from_millis(20));
    network.respond("/dashboard", Response::new(200, "fresh"));
    let layer = layer(&network);
    put_aged(&layer, "/dashboard", "cached", Duration::days(2));

    let served = layer
      .stale_while_revalidate(NS, get("/dashboard"), None)
      .await;
    assert_eq!(served.response.body, b"cached");
    let revalidation = served.revalidation.expect("refresh should be running");
    assert!(!revalidation.handle.is_finished());

    revalidation.settled().await;
    let key = cache_key(&reqwest::Method::GET, &get("/dashboard").url);
    let entry = layer.storage().get(NS, &key).unwrap().unwrap();
    assert_eq!(entry.response.body, b"fresh");
  }

  #[tokio::test]
  async fn test_navigation_no_store_is_not_cached() {
    let network = ScriptedNetwork::new();
    network.respond(
      "/account",
      Response::new(200, "private").with_header("cache-control", "no-store"),
    );
    let layer = layer(&network);

    let served = layer.stale_while_revalidate(NS, get("/account"), None).await;
    assert_eq!(served.response.body, b"private");
    assert_eq!(layer.storage().len(NS).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_navigation_offline_serves_fallback_page() {
    let network = ScriptedNetwork::new();
    network.respond("/offline", Response::new(200, "you are offline"));
    let layer = layer(&network);
    layer.precache(NS, get("/offline")).await.unwrap();

    let fallback = cache_key(&reqwest::Method::GET, &get("/offline").url);
    let served = layer
      .stale_while_revalidate(NS, get("/dashboard"), Some(&fallback))
      .await;
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.body, b"you are offline");

    let without = layer.stale_while_revalidate(NS, get("/dashboard"), None).await;
    assert_eq!(without.response.status, 503);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_bounded_inserts_respect_bound() {
    let network = ScriptedNetwork::new();
    let paths: Vec<String> = (0..20).map(|i| format!("/images/{}.png", i)).collect();
    for path in &paths {
      network.respond(path, Response::new(200, path.as_str()));
    }
    let layer = layer(&network);

    let tasks: Vec<_> = paths
      .iter()
      .map(|path| {
        let layer = layer.clone();
        let request = get(path);
        tokio::spawn(async move { layer.bounded_cache_first(NS, request, 2).await })
      })
      .collect();
    for task in tasks {
      let served = task.await.unwrap();
      assert_eq!(served.source, CacheSource::Network);
    }

    let storage = layer.storage();
    assert_eq!(storage.len(NS).unwrap(), 2);
    let keys = storage.keys(NS).unwrap();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
    for key in &keys {
      let entry = storage.get(NS, key).unwrap().unwrap();
      assert!(paths.iter().any(|p| entry.url.ends_with(p.as_str())));
    }
  }
}
