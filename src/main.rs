mod bridge;
mod cache;
mod config;
mod connectivity;
mod db;
mod http;
mod logging;
mod network;
mod queue;
mod router;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::bridge::{ClientHandle, ClientMessage, WorkerMessage};
use crate::connectivity::ConnectivityMonitor;
use crate::http::Request;
use crate::network::{HttpNetwork, Network};
use crate::sync::DrainOutcome;
use crate::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-capable request cache and mutation queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send one request through the worker and print the response body
  Fetch {
    /// Path on the configured origin, or an absolute URL
    target: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Extra header, as 'Name: value'
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Issue the request as a full page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Inspect or manage the offline mutation queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Replay queued mutations now
  Sync,
  /// Watch connectivity and replay the queue whenever the network returns.
  /// Worker messages are printed as JSON lines; client messages such as
  /// {"type":"START_SYNC"} are read from stdin.
  Watch,
  /// Inspect the response cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// List queued mutations in replay order
  List,
  /// Show one mutation, including its replay payload
  Show { id: i64 },
  /// Reset a failed or dead-lettered mutation to pending
  Retry { id: i64 },
  /// Delete a mutation without replaying it
  Discard { id: i64 },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Namespaces and their entry counts
  Stats,
  /// Keys of one namespace, oldest first
  Keys { namespace: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log.level, &config.log_dir()?)?;

  let db = Arc::new(db::Database::open(&config.database_path()?)?);
  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new()?);
  let (worker, inbound) = Worker::new(&config, db, Arc::clone(&network))?;

  match args.command {
    Command::Fetch {
      target,
      method,
      data,
      headers,
      navigate,
    } => {
      worker.start().await?;
      let request = build_request(&worker, &target, &method, data, &headers, navigate)?;
      let served = worker.handle_fetch(request).await?;

      eprintln!("{} ({})", served.response.status, served.source);
      std::io::stdout().write_all(&served.response.body)?;

      // Let a background refresh land before the process exits
      served.settle().await;
    }
    Command::Queue { action } => run_queue_action(&worker, action)?,
    Command::Sync => {
      let mut client = worker.bridge().connect();
      let drain = worker.sync().drain();
      tokio::pin!(drain);

      let outcome = loop {
        tokio::select! {
          outcome = &mut drain => break outcome?,
          Some(message) = client.next() => print_message(&message)?,
        }
      };
      while let Some(message) = client.try_next() {
        print_message(&message)?;
      }
      if outcome == DrainOutcome::Coalesced {
        println!("A drain is already running");
      }
    }
    Command::Watch => {
      worker.start().await?;
      let (monitor, connectivity) = ConnectivityMonitor::new(
        network,
        config.origin.clone(),
        Duration::from_secs(config.connectivity.probe_interval_secs),
      );
      let _probe = monitor.spawn();
      let listener = worker.bridge().connect();
      let commands = worker.bridge().connect();

      tokio::select! {
        result = worker.run(inbound, connectivity) => result?,
        result = print_messages(listener) => result?,
        result = forward_commands(commands) => result?,
        _ = tokio::signal::ctrl_c() => {}
      }
    }
    Command::Cache { action } => match action {
      CacheAction::Stats => {
        for (namespace, entries) in worker.cache_stats()? {
          println!("{:<32} {:>6}", namespace, entries);
        }
      }
      CacheAction::Keys { namespace } => {
        for key in worker.cache_keys(&namespace)? {
          println!("{}", key);
        }
      }
    },
  }

  Ok(())
}

fn build_request(
  worker: &Worker,
  target: &str,
  method: &str,
  data: Option<String>,
  headers: &[String],
  navigate: bool,
) -> Result<Request> {
  let url = worker.resolve(target)?;
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = if navigate {
    Request::navigate(url)
  } else {
    Request::new(method, url)
  };
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Header must look like 'Name: value', got '{}'", header))?;
    request = request.with_header(name.trim(), value.trim());
  }
  if let Some(data) = data {
    request = request.with_body(data);
  }
  Ok(request)
}

fn run_queue_action(worker: &Worker, action: QueueAction) -> Result<()> {
  let queue = worker.queue();
  match action {
    QueueAction::List => {
      for m in queue.list_pending()? {
        println!(
          "{:>6}  {:<8} {:>3}  {:<6} {}  {}  {}",
          m.id,
          m.status,
          m.attempts,
          m.method,
          m.endpoint,
          m.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          m.last_error.as_deref().unwrap_or("")
        );
      }
    }
    QueueAction::Show { id } => {
      let m = queue
        .get(id)?
        .ok_or_else(|| eyre!("No queued mutation with id {}", id))?;
      println!("id:        {}", m.id);
      println!("status:    {}", m.status);
      println!("request:   {} {}", m.method, m.endpoint);
      println!("enqueued:  {}", m.enqueued_at.to_rfc3339());
      println!("attempts:  {}", m.attempts);
      if let Some(at) = m.last_attempt_at {
        println!("last try:  {}", at.to_rfc3339());
      }
      if let Some(error) = &m.last_error {
        println!("error:     {}", error);
      }
      for (name, value) in &m.payload.headers {
        println!("header:    {}: {}", name, value);
      }
      println!();
      std::io::stdout().write_all(&m.payload.body)?;
      println!();
    }
    QueueAction::Retry { id } => {
      if !queue.retry(id)? {
        return Err(eyre!("No queued mutation with id {}", id));
      }
      println!("Mutation {} reset to pending", id);
    }
    QueueAction::Discard { id } => {
      if !queue.discard(id)? {
        return Err(eyre!("No queued mutation with id {}", id));
      }
      println!("Mutation {} discarded", id);
    }
  }
  Ok(())
}

fn print_message(message: &WorkerMessage) -> Result<()> {
  println!("{}", serde_json::to_string(message)?);
  Ok(())
}

async fn print_messages(mut client: ClientHandle) -> Result<()> {
  while let Some(message) = client.next().await {
    print_message(&message)?;
  }
  Ok(())
}

/// Forward JSON client messages from stdin to the worker.
async fn forward_commands(client: ClientHandle) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    match serde_json::from_str::<ClientMessage>(line) {
      Ok(message) => client.send(message)?,
      Err(e) => eprintln!("Ignoring client message: {}", e),
    }
  }

  // stdin closed; keep watching until Ctrl-C
  std::future::pending::<()>().await;
  Ok(())
}
