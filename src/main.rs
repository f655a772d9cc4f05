mod background;
mod cache;
mod commands;
mod config;
mod host;
mod http;
mod logging;
mod network;
mod registration;
mod runtime;
mod strategy;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use background::NoopQueue;
use cache::{CacheStorage, Partition, ResponseSource, Served, SqliteStorage};
use commands::Action;
use config::Config;
use host::ConsoleHost;
use http::Request;
use network::HttpFetcher;
use registration::{ConfigLoader, Registration};
use runtime::WorkerRuntime;
use worker::{Collaborators, ServiceWorker};

type CliCollaborators = Collaborators<SqliteStorage, HttpFetcher, ConsoleHost>;
type CliRegistration = Registration<SqliteStorage, HttpFetcher, ConsoleHost>;

#[derive(Parser, Debug)]
#[command(name = "tandem-sw")]
#[command(about = "Offline-first request interception and cache orchestration")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tandem-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the active version tag
  #[arg(long)]
  version_tag: Option<String>,

  /// Path to the partition database
  #[arg(long)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the shell assets for the active version
  Install,
  /// Delete partitions from other versions and take control
  Activate,
  /// Issue one request through the worker
  Fetch {
    /// Absolute URL or a path on the origin
    target: String,
    /// Treat the request as a full-page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// List partitions and their entries
  Partitions,
  /// Deliver a push message
  Push { payload: Option<String> },
  /// Fire a background sync
  Sync { tag: Option<String> },
  /// Click a notification
  Click { tag: Option<String> },
  /// Serve console commands from stdin, polling for updates
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = load_config(args.config.as_deref(), &args.version_tag, &args.db)?;
  let _log_guard = logging::init(&config.log)?;

  let storage = match &config.storage_path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  let collaborators = Collaborators {
    storage: Arc::new(storage),
    fetcher: Arc::new(HttpFetcher::new()?),
    host: Arc::new(ConsoleHost::new()),
    queue: Arc::new(NoopQueue),
  };
  let loader = config_loader(&args);

  match args.command {
    Command::Install => {
      let worker = ServiceWorker::new(config, collaborators);
      worker.on_install().await?;
      println!(
        "installed {} ({} assets)",
        worker.version(),
        worker.config().precache.len()
      );
    }
    Command::Activate => {
      let worker = ServiceWorker::new(config, collaborators);
      if !worker.resume()? {
        return Err(eyre!(
          "Version {} is not installed, run `tandem-sw install` first",
          worker.version()
        ));
      }
      for name in worker.on_activate().await? {
        println!("deleted {}", name);
      }
      println!("active {}", worker.version());
    }
    Command::Partitions => print_partitions(collaborators.storage.as_ref())?,
    Command::Fetch {
      target,
      navigate,
      method,
      data,
    } => {
      let mut request = build_request(&config, &method, &target, navigate)?;
      if let Some(data) = data {
        request = request.with_body(data.into_bytes());
      }
      let runtime = start(config, collaborators, loader).await?.1;
      let result = runtime.fetch(request).await;
      runtime.shutdown().await?;
      print_served(&result?);
    }
    Command::Push { payload } => {
      let runtime = start(config, collaborators, loader).await?.1;
      let payload = payload.unwrap_or_default().into_bytes();
      let result = runtime.push(payload).await;
      runtime.shutdown().await?;
      result?;
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync_tag.clone());
      let runtime = start(config, collaborators, loader).await?.1;
      let result = runtime.sync(&tag).await;
      runtime.shutdown().await?;
      println!("sync {}: {}", tag, if result? { "flushed" } else { "ignored" });
    }
    Command::Click { tag } => {
      let tag = tag.unwrap_or_else(|| config.notification.default_tag.clone());
      let runtime = start(config, collaborators, loader).await?.1;
      let result = runtime.notification_click(&tag).await;
      runtime.shutdown().await?;
      println!("focused client {}", result?);
    }
    Command::Run => {
      let (registration, runtime) = start(config, collaborators, loader).await?;
      run(registration, runtime).await?;
    }
  }

  Ok(())
}

fn load_config(
  path: Option<&std::path::Path>,
  version_tag: &Option<String>,
  db: &Option<PathBuf>,
) -> Result<Config> {
  let mut config = Config::load(path)?;

  // Override from command line
  if let Some(version) = version_tag {
    config.version = version.clone();
  }
  if let Some(db) = db {
    config.storage_path = Some(db.clone());
  }

  config.validate()?;
  Ok(config)
}

/// Reload configuration with the same command-line overrides.
fn config_loader(args: &Args) -> ConfigLoader {
  let path = args.config.clone();
  let version_tag = args.version_tag.clone();
  let db = args.db.clone();
  Box::new(move || load_config(path.as_deref(), &version_tag, &db))
}

/// Register the worker and start its event loop.
async fn start(
  config: Config,
  collaborators: CliCollaborators,
  loader: ConfigLoader,
) -> Result<(Arc<CliRegistration>, WorkerRuntime)> {
  let registration = Arc::new(Registration::register(config, collaborators, loader).await?);
  let runtime = WorkerRuntime::start(Arc::clone(&registration));
  Ok((registration, runtime))
}

fn build_request(config: &Config, method: &str, target: &str, navigate: bool) -> Result<Request> {
  let url = if target.starts_with('/') {
    config.resolve(target)?.to_string()
  } else {
    target.to_string()
  };

  let request = Request::new(method, &url)?;
  Ok(if navigate {
    request.with_mode(http::RequestMode::Navigate)
  } else {
    request
  })
}

fn print_served(served: &Served) {
  match served.source {
    ResponseSource::Fallback | ResponseSource::OfflineShell | ResponseSource::Synthesized => {
      eprintln!("network unreachable, served {} response", served.source)
    }
    ResponseSource::Network | ResponseSource::Cache => {}
  }
  println!(
    "{} {} ({})",
    served.response.status, served.response.status_text, served.source
  );
  if let Some(cached_at) = served.cached_at {
    println!("cached-at: {}", cached_at.to_rfc3339());
  }
  for (name, value) in &served.response.headers {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", served.response.text());
}

fn print_partitions<S: CacheStorage>(storage: &S) -> Result<()> {
  for name in storage.keys()? {
    println!("{}", name);
    for entry in storage.entries(&name)? {
      println!("  {}", entry);
    }
  }
  Ok(())
}

/// Read console commands until EOF or `quit`.
async fn run(registration: Arc<CliRegistration>, runtime: WorkerRuntime) -> Result<()> {
  let active = registration.active()?;
  let config = active.config().clone();
  info!(
    scope = registration.scope(),
    version = active.version(),
    static_partition = %active.partitions().names().name(Partition::Static),
    "Worker running"
  );

  let poller = registration.poll_updates(Duration::from_secs(config.update_interval_secs));
  let mut updates = registration.subscribe();
  let listener = tokio::spawn(async move {
    while let Ok(event) = updates.recv().await {
      info!(?event, "Update");
    }
  });

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }

    let action = match commands::parse(&line) {
      Ok(action) => action,
      Err(e) => {
        eprintln!("{}", e);
        continue;
      }
    };

    // Configuration may have moved on after an update
    let config = registration.active()?.config().clone();
    let result = match action {
      Action::Request {
        method,
        target,
        navigate,
      } => match build_request(&config, &method, &target, navigate) {
        Ok(request) => runtime.fetch(request).await.map(|s| print_served(&s)),
        Err(e) => Err(e),
      },
      Action::Push(payload) => runtime
        .push(payload.unwrap_or_default().into_bytes())
        .await
        .map(|_| ()),
      Action::Sync(tag) => runtime
        .sync(&tag.unwrap_or(config.sync_tag))
        .await
        .map(|_| ()),
      Action::Click(tag) => runtime
        .notification_click(&tag.unwrap_or(config.notification.default_tag))
        .await
        .map(|id| println!("focused client {}", id)),
      Action::Update => registration.check_for_update().await.map(|v| match v {
        Some(version) => println!("updated to {}", version),
        None => println!("already up to date"),
      }),
      Action::Partitions => print_partitions(registration.collaborators().storage.as_ref()),
      Action::Help => {
        println!("{}", commands::help());
        Ok(())
      }
      Action::Quit => break,
    };

    if let Err(e) = result {
      eprintln!("error: {:#}", e);
    }
  }

  poller.abort();
  listener.abort();
  runtime.shutdown().await
}
