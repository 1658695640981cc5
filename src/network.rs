//! Network access behind a narrow trait so executors and the sync
//! coordinator can run against scripted networks in tests.

use color_eyre::{eyre::eyre, Report, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::time::Duration;

use crate::http::{Headers, Request, Response};

/// Something that can put a request on the wire.
///
/// `Ok` means the server answered, whatever the status code. `Err` usually
/// means no response was received at all (offline, DNS failure, connection
/// refused); use [`is_unreachable`] to tell that apart from an
/// [`IncompleteResponse`].
pub trait Network: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>>;
}

/// The server sent a status line but the body could not be read in full.
/// The request reached the server, so it must not be treated as offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteResponse {
  pub status: u16,
  pub reason: String,
}

impl fmt::Display for IncompleteResponse {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "response with status {} ended early: {}",
      self.status, self.reason
    )
  }
}

impl std::error::Error for IncompleteResponse {}

/// Whether a fetch error means the server was never reached.
pub fn is_unreachable(error: &Report) -> bool {
  error.downcast_ref::<IncompleteResponse>().is_none()
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    Self::build(reqwest::Client::builder())
  }

  /// Client that ignores proxy settings, for talking to local test servers.
  #[cfg(test)]
  pub fn direct() -> Result<Self> {
    Self::build(reqwest::Client::builder().no_proxy())
  }

  fn build(builder: reqwest::ClientBuilder) -> Result<Self> {
    let client = builder
      .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
    let client = self.client.clone();
    async move {
      let url = request.url.clone();
      let mut builder = client.request(request.method, request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if !request.body.is_empty() {
        builder = builder.body(request.body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

      let status = response.status().as_u16();
      let headers: Headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();
      let body = response.bytes().await.map_err(|e| {
        Report::new(IncompleteResponse {
          status,
          reason: e.to_string(),
        })
        .wrap_err(format!("Failed to read response body from {}", url))
      })?;

      Ok(Response {
        status,
        headers,
        body: body.to_vec(),
      })
    }
    .boxed()
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted network used across the crate's tests.

  use super::*;
  use std::collections::{HashMap, VecDeque};
  use std::sync::{Arc, Mutex};

  /// What the scripted network does for one call.
  #[derive(Debug, Clone)]
  pub enum Reply {
    Respond(Response),
    /// Status line arrives, body breaks off
    CutOff(u16),
    Offline,
  }

  /// Replies are consumed per URL path in order; the last reply for a path
  /// repeats until a new one is scripted. Unscripted paths behave as
  /// offline.
  #[derive(Clone, Default)]
  pub struct ScriptedNetwork {
    script: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<Vec<Request>>>,
    delay: Option<Duration>,
  }

  impl ScriptedNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = Some(delay);
      self
    }

    pub fn respond(&self, path: &str, response: Response) {
      self.push(path, Reply::Respond(response));
    }

    pub fn cut_off(&self, path: &str, status: u16) {
      self.push(path, Reply::CutOff(status));
    }

    pub fn offline(&self, path: &str) {
      self.push(path, Reply::Offline);
    }

    fn push(&self, path: &str, reply: Reply) {
      let mut script = self.script.lock().unwrap();
      let entry = script.entry(path.to_string()).or_default();
      if entry.last_served {
        entry.replies.clear();
        entry.last_served = false;
      }
      entry.replies.push_back(reply);
    }

    pub fn calls(&self) -> Vec<Request> {
      self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
      self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == path)
        .count()
    }
  }

  /// Serve one connection on a local port with a canned raw HTTP reply,
  /// then close it. Returns the server's base URL.
  pub async fn serve_once(reply: &'static [u8]) -> url::Url {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      read_request(&mut socket).await;
      socket.write_all(reply).await.unwrap();
      socket.shutdown().await.ok();
    });
    url::Url::parse(&format!("http://{}/", addr)).unwrap()
  }

  /// Consume the request head and any body announced by content-length.
  async fn read_request(socket: &mut tokio::net::TcpStream) {
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
      let n = socket.read(&mut chunk).await.unwrap_or(0);
      if n == 0 {
        return;
      }
      buf.extend_from_slice(&chunk[..n]);
      if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let length = head
          .lines()
          .find_map(|line| line.strip_prefix("content-length:"))
          .and_then(|v| v.trim().parse::<usize>().ok())
          .unwrap_or(0);
        if buf.len() >= end + 4 + length {
          return;
        }
      }
    }
  }

  #[derive(Default)]
  struct Script {
    replies: VecDeque<Reply>,
    /// The final reply has been handed out at least once
    last_served: bool,
  }

  impl Network for ScriptedNetwork {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
      self.calls.lock().unwrap().push(request.clone());
      let reply = {
        let mut script = self.script.lock().unwrap();
        match script.get_mut(request.url.path()) {
          Some(entry) if entry.replies.len() > 1 => entry.replies.pop_front(),
          Some(entry) => {
            entry.last_served = true;
            entry.replies.front().cloned()
          }
          None => None,
        }
      };
      let delay = self.delay;

      async move {
        if let Some(delay) = delay {
          tokio::time::sleep(delay).await;
        }
        match reply {
          Some(Reply::Respond(response)) => Ok(response),
          Some(Reply::CutOff(status)) => Err(Report::new(IncompleteResponse {
            status,
            reason: "connection closed".to_string(),
          })),
          Some(Reply::Offline) | None => Err(eyre!("network unreachable: {}", request.url)),
        }
      }
      .boxed()
    }
  }
}
