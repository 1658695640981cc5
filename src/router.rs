//! Request classification: an ordered rule table mapping same-origin
//! requests to a strategy. First match wins.

use url::Url;

use crate::config::RoutesConfig;
use crate::http::{Request, RequestMode};

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Mutation forwarded to the network, diverted to the offline queue when
  /// the network cannot be reached
  QueueMutation,
  /// Immutable build asset
  CacheFirst,
  /// Image, cache-first with a bounded namespace
  BoundedCacheFirst,
  /// Reference data, stale-while-revalidate within a TTL
  TtlRevalidate,
  /// Other API traffic; never cached, failures reach the caller
  NetworkOnly,
  /// Full page load, stale-while-revalidate with offline fallback
  Navigation,
}

/// Path matcher for one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatch {
  Exact(String),
  Prefix(String),
  /// Any of these extensions, lowercase and without the dot
  Extension(Vec<String>),
  Any,
}

impl PathMatch {
  /// Parse a configured endpoint: `foo*` matches by prefix, anything else
  /// exactly.
  pub fn endpoint(pattern: &str) -> Self {
    match pattern.strip_suffix('*') {
      Some(prefix) => Self::Prefix(prefix.to_string()),
      None => Self::Exact(pattern.to_string()),
    }
  }

  pub fn matches(&self, path: &str) -> bool {
    match self {
      Self::Exact(p) => path == p,
      Self::Prefix(p) => path.starts_with(p.as_str()),
      Self::Extension(exts) => path
        .rsplit_once('.')
        .map(|(_, ext)| exts.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false),
      Self::Any => true,
    }
  }
}

/// Which requests a rule applies to, besides the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodMatch {
  /// POST, PUT, PATCH or DELETE
  Mutation,
  Get,
  /// GET issued as a navigation
  Navigation,
}

impl MethodMatch {
  fn matches(&self, request: &Request) -> bool {
    match self {
      Self::Mutation => request.is_mutation(),
      Self::Get => request.method == reqwest::Method::GET,
      Self::Navigation => {
        request.method == reqwest::Method::GET && request.mode == RequestMode::Navigate
      }
    }
  }
}

#[derive(Debug, Clone)]
pub struct Rule {
  pub method: MethodMatch,
  pub path: PathMatch,
  pub strategy: Strategy,
}

impl Rule {
  fn new(method: MethodMatch, path: PathMatch, strategy: Strategy) -> Self {
    Self {
      method,
      path,
      strategy,
    }
  }

  fn matches(&self, request: &Request) -> bool {
    self.method.matches(request) && self.path.matches(request.url.path())
  }
}

/// Ordered routing table for one origin.
#[derive(Debug, Clone)]
pub struct Router {
  origin: url::Origin,
  rules: Vec<Rule>,
}

impl Router {
  /// Build the table in its fixed precedence order: queued mutations,
  /// build assets, images, reference data, other API paths, navigations.
  pub fn new(origin: &Url, routes: &RoutesConfig) -> Self {
    let mut rules = Vec::new();

    for endpoint in &routes.mutation_endpoints {
      rules.push(Rule::new(
        MethodMatch::Mutation,
        PathMatch::endpoint(endpoint),
        Strategy::QueueMutation,
      ));
    }

    rules.push(Rule::new(
      MethodMatch::Get,
      PathMatch::Prefix(routes.asset_prefix.clone()),
      Strategy::CacheFirst,
    ));

    rules.push(Rule::new(
      MethodMatch::Get,
      PathMatch::Prefix(routes.image_prefix.clone()),
      Strategy::BoundedCacheFirst,
    ));
    rules.push(Rule::new(
      MethodMatch::Get,
      PathMatch::Extension(routes.image_extensions.iter().cloned().collect()),
      Strategy::BoundedCacheFirst,
    ));

    for endpoint in &routes.reference_endpoints {
      rules.push(Rule::new(
        MethodMatch::Get,
        PathMatch::Exact(endpoint.clone()),
        Strategy::TtlRevalidate,
      ));
    }

    rules.push(Rule::new(
      MethodMatch::Get,
      PathMatch::Prefix(routes.api_prefix.clone()),
      Strategy::NetworkOnly,
    ));

    rules.push(Rule::new(
      MethodMatch::Navigation,
      PathMatch::Any,
      Strategy::Navigation,
    ));

    Self {
      origin: origin.origin(),
      rules,
    }
  }

  /// Route a request. `None` means the request is not handled and passes
  /// through to the network untouched.
  pub fn route(&self, request: &Request) -> Option<Strategy> {
    if request.url.origin() != self.origin {
      return None;
    }

    self
      .rules
      .iter()
      .find(|rule| rule.matches(request))
      .map(|rule| rule.strategy)
  }
}
