//! Core types for the cache store.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::{Request, Response};

/// Content class of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
  /// Immutable, content-hashed build assets
  Static,
  Images,
  /// Navigations and the offline fallback page
  Pages,
  /// Reference-data API responses
  Api,
}

impl NamespaceKind {
  pub const ALL: [NamespaceKind; 4] = [
    NamespaceKind::Static,
    NamespaceKind::Images,
    NamespaceKind::Pages,
    NamespaceKind::Api,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Images => "images",
      Self::Pages => "pages",
      Self::Api => "api",
    }
  }
}

/// Naming scheme for the namespaces of one engine version.
///
/// A version bump yields a disjoint set of names; whatever is persisted
/// outside the current set is garbage at activation.
#[derive(Debug, Clone)]
pub struct Namespaces {
  prefix: String,
  version: u32,
}

impl Namespaces {
  pub fn new(prefix: impl Into<String>, version: u32) -> Self {
    Self {
      prefix: prefix.into(),
      version,
    }
  }

  pub fn name(&self, kind: NamespaceKind) -> String {
    format!("{}-{}-v{}", self.prefix, kind.as_str(), self.version)
  }

  pub fn all(&self) -> Vec<String> {
    NamespaceKind::ALL.iter().map(|k| self.name(*k)).collect()
  }
}

/// One cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub method: String,
  pub url: String,
  pub response: Response,
  pub inserted_at: DateTime<Utc>,
  /// Last successful validation against the network, tracked separately
  /// from the response's own cache headers
  pub validated_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
  pub fn new(request: &Request, response: Response) -> Self {
    Self {
      key: cache_key(&request.method, &request.url),
      method: request.method.to_string(),
      url: normalize_url(&request.url),
      response,
      inserted_at: Utc::now(),
      validated_at: None,
    }
  }

  /// Mark the entry as validated now.
  pub fn validated(mut self) -> Self {
    self.validated_at = Some(self.inserted_at);
    self
  }

  /// Timestamp freshness is measured from.
  pub fn freshness(&self) -> DateTime<Utc> {
    self.validated_at.unwrap_or(self.inserted_at)
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, past its freshness window or unchecked
  CacheStale,
  /// Network unavailable, serving the offline fallback page
  Offline,
  /// Nothing could answer; synthetic response
  Unavailable,
  /// Mutation captured by the offline queue
  Queued,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Network => write!(f, "network"),
      Self::CacheFresh => write!(f, "cache-fresh"),
      Self::CacheStale => write!(f, "cache-stale"),
      Self::Offline => write!(f, "offline-fallback"),
      Self::Unavailable => write!(f, "unavailable"),
      Self::Queued => write!(f, "queued"),
    }
  }
}

/// Normalize a URL for keying: the fragment never reaches the server.
pub fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

/// Stable cache key for a request.
pub fn cache_key(method: &Method, url: &Url) -> String {
  let input = format!("{} {}", method.as_str(), normalize_url(url));

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}
