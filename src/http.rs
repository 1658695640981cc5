//! Request and response values passed between the router, the caches and
//! the network.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Header map with lowercased names.
pub type Headers = BTreeMap<String, String>;

/// How the request was issued by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Ordinary subresource or data fetch
  #[default]
  Fetch,
  /// Full page load
  Navigate,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: Vec::new(),
      mode: RequestMode::Fetch,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  /// Whether this method may change server state.
  pub fn is_mutation(&self) -> bool {
    matches!(
      self.method,
      Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
  }
}

/// A response, either from the network or reconstructed from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  /// Empty 503 returned when neither the network nor the cache can answer.
  pub fn service_unavailable() -> Self {
    Self::new(503, Vec::new())
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    let mut response = Self::new(status, value.to_string());
    response
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    response
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// True when the response forbids being stored (`Cache-Control: no-store`).
  pub fn is_no_store(&self) -> bool {
    self
      .headers
      .get("cache-control")
      .map(|v| {
        v.split(',')
          .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
      })
      .unwrap_or(false)
  }
}
