//! Periodic reachability probe that turns network state changes into
//! reconnection events.

use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::http::Request;
use crate::network::{is_unreachable, Network};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  /// No probe has completed yet
  Unknown,
  Online,
  Offline,
}

/// Probes the origin on an interval and publishes the result.
pub struct ConnectivityMonitor {
  network: Arc<dyn Network>,
  probe_url: Url,
  interval: Duration,
  tx: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
  pub fn new(
    network: Arc<dyn Network>,
    probe_url: Url,
    interval: Duration,
  ) -> (Self, watch::Receiver<Connectivity>) {
    let (tx, rx) = watch::channel(Connectivity::Unknown);
    let monitor = Self {
      network,
      probe_url,
      interval,
      tx,
    };
    (monitor, rx)
  }

  /// One probe. Any HTTP answer, even an error status, means the network
  /// path works.
  pub async fn probe(&self) -> Connectivity {
    let request = Request::new(Method::HEAD, self.probe_url.clone());
    match self.network.fetch(request).await {
      Ok(_) => Connectivity::Online,
      Err(e) if !is_unreachable(&e) => Connectivity::Online,
      Err(e) => {
        debug!("Connectivity probe failed: {}", e);
        Connectivity::Offline
      }
    }
  }

  /// Probe now and publish. Returns the new state.
  pub async fn check(&self) -> Connectivity {
    let state = self.probe().await;
    let changed = self.tx.send_if_modified(|current| {
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    });
    if changed {
      info!("Connectivity changed: {:?}", state);
    }
    state
  }

  /// Probe forever on the configured interval. Stops when every receiver
  /// has been dropped.
  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        ticker.tick().await;
        if self.tx.is_closed() {
          break;
        }
        self.check().await;
      }
    })
  }
}
