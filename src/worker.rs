//! The background worker: owns the cache store and the offline queue,
//! answers intercepted requests and reacts to client and connectivity
//! events.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bridge::{ClientBridge, ClientMessage, WorkerMessage};
use crate::cache::{
  cache_key, CacheLayer, CacheSource, CacheStorage, NamespaceKind, Namespaces, Served,
  SqliteStorage,
};
use crate::config::{Config, RoutesConfig};
use crate::connectivity::Connectivity;
use crate::db::Database;
use crate::http::{Request, Response};
use crate::network::{is_unreachable, Network};
use crate::queue::{OfflineQueue, Payload};
use crate::router::{Router, Strategy};
use crate::sync::{RetryPolicy, SyncCoordinator};

/// Capacity of the worker to client broadcast channel
const BRIDGE_CAPACITY: usize = 256;

pub struct Worker {
  origin: Url,
  router: Router,
  cache: CacheLayer<SqliteStorage>,
  queue: OfflineQueue,
  sync: SyncCoordinator,
  bridge: ClientBridge,
  namespaces: Namespaces,
  routes: RoutesConfig,
  offline_page: Request,
  preserve_headers: BTreeSet<String>,
}

impl Worker {
  /// Build a worker over `db`. The returned receiver carries client
  /// messages and is consumed by [`Worker::run`].
  pub fn new(
    config: &Config,
    db: Arc<Database>,
    network: Arc<dyn Network>,
  ) -> Result<(Self, mpsc::UnboundedReceiver<ClientMessage>)> {
    let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));
    let cache = CacheLayer::new(storage, Arc::clone(&network));
    let queue = OfflineQueue::new(db);
    let (bridge, inbound) = ClientBridge::new(BRIDGE_CAPACITY);
    let sync = SyncCoordinator::new(
      queue.clone(),
      network,
      bridge.clone(),
      RetryPolicy::from_config(&config.queue),
    );

    let offline_url = config
      .origin
      .join(&config.routes.offline_fallback)
      .map_err(|e| eyre!("Invalid offline fallback path: {}", e))?;

    let worker = Self {
      origin: config.origin.clone(),
      router: Router::new(&config.origin, &config.routes),
      cache,
      queue,
      sync,
      bridge,
      namespaces: Namespaces::new(config.cache.prefix.clone(), config.cache.version),
      routes: config.routes.clone(),
      offline_page: Request::get(offline_url),
      preserve_headers: config.queue.preserve_headers.clone(),
    };
    Ok((worker, inbound))
  }

  /// Install then activate.
  pub async fn start(&self) -> Result<()> {
    self.install().await?;
    self.activate()?;
    Ok(())
  }

  /// Create this version's namespaces and precache the offline page.
  pub async fn install(&self) -> Result<()> {
    let storage = self.cache.storage();
    for name in self.namespaces.all() {
      storage.create_namespace(&name)?;
    }

    let pages = self.namespaces.name(NamespaceKind::Pages);
    let fallback_key = self.offline_page_key();
    if storage.get(&pages, &fallback_key)?.is_some() {
      return Ok(());
    }

    match self.cache.precache(&pages, self.offline_page.clone()).await {
      Ok(response) if response.is_success() => {
        info!("Precached offline page {}", self.offline_page.url);
      }
      Ok(response) => warn!(
        "Offline page {} answered {}, not precached",
        self.offline_page.url, response.status
      ),
      Err(e) => warn!("Could not precache offline page: {}", e),
    }
    Ok(())
  }

  /// Destroy every namespace that does not belong to this version.
  pub fn activate(&self) -> Result<Vec<String>> {
    let storage = self.cache.storage();
    let current = self.namespaces.all();
    let mut removed = Vec::new();

    for name in storage.namespaces()? {
      if !current.contains(&name) {
        storage.delete_namespace(&name)?;
        info!("Deleted stale cache namespace {}", name);
        removed.push(name);
      }
    }
    Ok(removed)
  }

  /// Handle one intercepted request.
  ///
  /// Unhandled and network-only requests go straight to the network, so a
  /// connectivity failure comes back as `Err` exactly as it would without
  /// the worker.
  pub async fn handle_fetch(&self, request: Request) -> Result<Served> {
    let strategy = self.router.route(&request);
    debug!("{} {} -> {:?}", request.method, request.url, strategy);

    let served = match strategy {
      None | Some(Strategy::NetworkOnly) => {
        let response = self.cache.network_only(request).await?;
        Served::new(response, CacheSource::Network)
      }
      Some(Strategy::QueueMutation) => return self.forward_or_enqueue(request).await,
      Some(Strategy::CacheFirst) => {
        let ns = self.namespaces.name(NamespaceKind::Static);
        self.cache.cache_first(&ns, request).await
      }
      Some(Strategy::BoundedCacheFirst) => {
        let ns = self.namespaces.name(NamespaceKind::Images);
        self
          .cache
          .bounded_cache_first(&ns, request, self.routes.image_max_entries)
          .await
      }
      Some(Strategy::TtlRevalidate) => {
        let ns = self.namespaces.name(NamespaceKind::Api);
        let ttl = self.routes.reference_ttl();
        self.cache.ttl_revalidate(&ns, request, ttl).await
      }
      Some(Strategy::Navigation) => {
        let ns = self.namespaces.name(NamespaceKind::Pages);
        let fallback = self.offline_page_key();
        self
          .cache
          .stale_while_revalidate(&ns, request, Some(&fallback))
          .await
      }
    };
    Ok(served)
  }

  /// Send a configured mutation. Any HTTP answer goes back to the caller
  /// untouched; only a connectivity failure diverts it to the queue. A
  /// response that breaks off mid-body reached the server and is returned
  /// as an error instead of being queued for a second delivery.
  async fn forward_or_enqueue(&self, request: Request) -> Result<Served> {
    match self.cache.network_only(request.clone()).await {
      Ok(response) => Ok(Served::new(response, CacheSource::Network)),
      Err(e) if !is_unreachable(&e) => Err(e),
      Err(e) => {
        let payload = Payload::from_request(&request, &self.preserve_headers);
        let id = self
          .queue
          .enqueue(&request.url, &request.method, &payload)?;
        let pending_count = self.queue.counts()?.total();
        info!(
          "Queued {} {} as mutation {} ({}), {} pending",
          request.method, request.url, id, e, pending_count
        );
        self
          .bridge
          .notify(WorkerMessage::Queued { pending_count });

        let body = json!({ "queued": true, "id": id });
        Ok(Served::new(Response::json(202, &body), CacheSource::Queued))
      }
    }
  }

  /// Process client messages and connectivity changes for the life of the
  /// worker. Drains run as separate tasks so requests keep flowing.
  pub async fn run(
    &self,
    mut inbound: mpsc::UnboundedReceiver<ClientMessage>,
    mut connectivity: watch::Receiver<Connectivity>,
  ) -> Result<()> {
    // Items left over from an earlier run drain as soon as the network is
    // known to be up, even if it never went down while we watched
    let mut online = *connectivity.borrow_and_update() == Connectivity::Online;
    if online {
      info!("Network reachable at start, draining offline queue");
      self.spawn_drain();
    }
    let mut watching = true;

    loop {
      tokio::select! {
        message = inbound.recv() => match message {
          Some(ClientMessage::StartSync) => self.spawn_drain(),
          Some(ClientMessage::GetStatus) => {
            if let Err(e) = self.publish_status() {
              warn!("Could not report queue status: {}", e);
            }
          }
          None => break,
        },
        changed = connectivity.changed(), if watching => {
          if changed.is_err() {
            watching = false;
            continue;
          }
          let now_online = *connectivity.borrow_and_update() == Connectivity::Online;
          if now_online && !online {
            info!("Connectivity restored, draining offline queue");
            self.spawn_drain();
          }
          online = now_online;
        }
      }
    }
    Ok(())
  }

  fn spawn_drain(&self) {
    let sync = self.sync.clone();
    tokio::spawn(async move {
      if let Err(e) = sync.drain().await {
        error!("Drain failed: {}", e);
      }
    });
  }

  /// Broadcast the current queue state.
  pub fn publish_status(&self) -> Result<()> {
    let counts = self.queue.counts()?;
    self.bridge.notify(WorkerMessage::Status {
      pending: counts.pending,
      failed: counts.failed,
      dead: counts.dead,
      draining: self.sync.is_draining(),
    });
    Ok(())
  }

  /// Namespaces with their entry counts.
  pub fn cache_stats(&self) -> Result<Vec<(String, usize)>> {
    let storage = self.cache.storage();
    storage
      .namespaces()?
      .into_iter()
      .map(|name| {
        let len = storage.len(&name)?;
        Ok((name, len))
      })
      .collect()
  }

  pub fn cache_keys(&self, namespace: &str) -> Result<Vec<String>> {
    self.cache.storage().keys(namespace)
  }

  /// Resolve a path against the configured origin; absolute URLs pass
  /// through.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    Url::parse(target)
      .or_else(|_| self.origin.join(target))
      .map_err(|e| eyre!("Invalid request target '{}': {}", target, e))
  }

  fn offline_page_key(&self) -> String {
    cache_key(&Method::GET, &self.offline_page.url)
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn sync(&self) -> &SyncCoordinator {
    &self.sync
  }

  pub fn bridge(&self) -> &ClientBridge {
    &self.bridge
  }
}
