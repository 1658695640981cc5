//! Message channel between the worker and foreground clients.
//!
//! Delivery is best-effort: a client that is not connected when a message is
//! sent never sees it, and a slow client may skip messages. Clients that need
//! the current state ask for it with [`ClientMessage::GetStatus`].

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Worker to client messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
  tag = "type",
  rename_all = "SCREAMING_SNAKE_CASE",
  rename_all_fields = "camelCase"
)]
pub enum WorkerMessage {
  /// A mutation was captured by the offline queue
  Queued { pending_count: usize },
  /// One item of a drain was processed
  SyncProgress { remaining: usize },
  /// A drain finished
  SyncComplete { succeeded: usize, failed: usize },
  /// Answer to [`ClientMessage::GetStatus`]
  Status {
    pending: usize,
    failed: usize,
    dead: usize,
    draining: bool,
  },
}

/// Client to worker messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// The client saw the network come back; drain the queue
  StartSync,
  GetStatus,
}

/// Worker side of the channel.
#[derive(Clone)]
pub struct ClientBridge {
  outbound: broadcast::Sender<WorkerMessage>,
  inbound: mpsc::UnboundedSender<ClientMessage>,
}

impl ClientBridge {
  /// Create the bridge together with the receiver the worker reads client
  /// messages from.
  pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
    let (outbound, _) = broadcast::channel(capacity);
    let (inbound, rx) = mpsc::unbounded_channel();
    (Self { outbound, inbound }, rx)
  }

  /// Send to every connected client.
  pub fn notify(&self, message: WorkerMessage) {
    match self.outbound.send(message) {
      Ok(receivers) => debug!("Delivered worker message to {} clients", receivers),
      // No client open; the message is dropped
      Err(broadcast::error::SendError(message)) => debug!("No clients for {:?}", message),
    }
  }

  /// Open a new client. It only sees messages sent after this call.
  pub fn connect(&self) -> ClientHandle {
    ClientHandle {
      rx: self.outbound.subscribe(),
      tx: self.inbound.clone(),
    }
  }
}

/// Foreground side of the channel.
pub struct ClientHandle {
  rx: broadcast::Receiver<WorkerMessage>,
  tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ClientHandle {
  pub fn send(&self, message: ClientMessage) -> Result<()> {
    self
      .tx
      .send(message)
      .map_err(|_| eyre!("Worker is no longer listening"))
  }

  /// Receive the next message. Skips over anything lost to lag; returns
  /// `None` once the worker is gone.
  pub async fn next(&mut self) -> Option<WorkerMessage> {
    loop {
      match self.rx.recv().await {
        Ok(message) => return Some(message),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!("Client lagged, {} worker messages lost", skipped);
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Non-blocking variant of [`next`](Self::next).
  pub fn try_next(&mut self) -> Option<WorkerMessage> {
    loop {
      match self.rx.try_recv() {
        Ok(message) => return Some(message),
        Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
          warn!("Client lagged, {} worker messages lost", skipped);
        }
        Err(_) => return None,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_format() {
    let queued = serde_json::to_value(WorkerMessage::Queued { pending_count: 3 }).unwrap();
    assert_eq!(queued, json!({"type": "QUEUED", "pendingCount": 3}));

    let complete = serde_json::to_value(WorkerMessage::SyncComplete {
      succeeded: 1,
      failed: 1,
    })
    .unwrap();
    assert_eq!(
      complete,
      json!({"type": "SYNC_COMPLETE", "succeeded": 1, "failed": 1})
    );

    let inbound: ClientMessage = serde_json::from_value(json!({"type": "START_SYNC"})).unwrap();
    assert_eq!(inbound, ClientMessage::StartSync);
  }

  #[tokio::test]
  async fn test_connected_clients_receive_messages() {
    let (bridge, _inbound) = ClientBridge::new(16);
    let mut a = bridge.connect();
    let mut b = bridge.connect();

    bridge.notify(WorkerMessage::SyncProgress { remaining: 2 });

    assert_eq!(a.next().await, Some(WorkerMessage::SyncProgress { remaining: 2 }));
    assert_eq!(b.next().await, Some(WorkerMessage::SyncProgress { remaining: 2 }));
  }

  #[test]
  fn test_messages_without_clients_are_dropped() {
    let (bridge, _inbound) = ClientBridge::new(16);
    bridge.notify(WorkerMessage::Queued { pending_count: 1 });

    let mut late = bridge.connect();
    assert_eq!(late.try_next(), None);
  }

  #[test]
  fn test_lagging_client_skips_lost_messages() {
    let (bridge, _inbound) = ClientBridge::new(2);
    let mut client = bridge.connect();
    for remaining in (0..5).rev() {
      bridge.notify(WorkerMessage::SyncProgress { remaining });
    }

    assert_eq!(
      client.try_next(),
      Some(WorkerMessage::SyncProgress { remaining: 1 })
    );
    assert_eq!(
      client.try_next(),
      Some(WorkerMessage::SyncProgress { remaining: 0 })
    );
    assert_eq!(client.try_next(), None);
  }

  #[tokio::test]
  async fn test_client_requests_reach_worker() {
    let (bridge, mut inbound) = ClientBridge::new(16);
    let client = bridge.connect();

    client.send(ClientMessage::StartSync).unwrap();
    assert_eq!(inbound.recv().await, Some(ClientMessage::StartSync));
  }
}
