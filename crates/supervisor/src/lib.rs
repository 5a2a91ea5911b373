#![deny(
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Wires a loaded [`config::AgentConfig`] into a running agent: acquires
//! the single-instance lock, opens the queue store, spawns one task per
//! enabled metric collector plus the uploader, checkpoint poller, and
//! clock-skew probe, serves the health endpoint, and notifies the service
//! manager (spec.md §6, §7).

mod notify;
mod tasks;

use std::sync::Arc;

use collectors::{
    Collector, CpuLoadCollector, DiskFreeBytesCollector, MemoryUsedCollector, NetworkBytesCollector,
    StreamLossCollector, ThermalCollector,
};
use config::AgentConfig;
use health::HealthRegistry;
use lock::InstanceLock;
use signal::CancellationToken;
use store::QueueStore;
use task::{labels::ProcessLabels, labels::TaskLabels, TaskManager};
use tokio::task::JoinHandle;

pub use notify::Notifier;

/// All the errors that can abort bootstrap or a running agent.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Another instance already holds the storage directory's lock.
    #[error(transparent)]
    Lock(#[from] lock::Error),
    /// The queue store could not be opened.
    #[error(transparent)]
    Store(#[from] store::Error),
    /// The health HTTP server failed to bind or serve.
    #[error(transparent)]
    Health(#[from] health::Error),
    /// The uploader's HTTP client could not be built.
    #[error(transparent)]
    Uploader(#[from] uploader::Error),
    /// The clock-skew probe's HTTP client could not be built.
    #[error(transparent)]
    ClockSkew(#[from] clockskew::Error),
    /// `remote.auth_token_file` could not be read.
    #[error("failed to read auth token file {path}: {source}")]
    AuthTokenFile {
        /// The configured path.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// A bootstrapped, not-yet-running agent.
pub struct Supervisor {
    config: AgentConfig,
    _lock: InstanceLock,
    store: QueueStore,
    health: HealthRegistry,
    cancel: CancellationToken,
    tasks: TaskManager,
    notifier: Arc<Notifier>,
}

impl Supervisor {
    /// Acquires the instance lock and opens the queue store. Both
    /// failures are fatal at startup (spec.md §7).
    pub async fn bootstrap(config: AgentConfig) -> Result<Self, Error> {
        let lock = InstanceLock::acquire(&config.storage.path)?;
        let store = QueueStore::open(&config.storage.path)?;
        let process_labels = ProcessLabels::new(&std::process::id().to_string());

        Ok(Self {
            config,
            _lock: lock,
            store,
            health: HealthRegistry::new(),
            cancel: CancellationToken::new(),
            tasks: TaskManager::with_process_labels(process_labels),
            notifier: Arc::new(Notifier::from_env()),
        })
    }

    /// The root cancellation token. A caller (typically `main`) should
    /// wire OS signal delivery to `cancellation().cancel()`.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The health registry, for callers that want to inspect it directly
    /// (e.g. an integration test polling readiness).
    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    fn spawn(&mut self, task_cat: &str, task_id: &str, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let task_labels = TaskLabels::new(task_cat, task_id, "supervisor");
        let process_labels = self.tasks.process_labels();
        let cleanup_labels = task_labels.clone();
        let handle: JoinHandle<Box<dyn task::TaskCleaner>> = tokio::spawn(async move {
            future.await;
            TaskManager::no_task_cleaner(process_labels, cleanup_labels)
        });
        self.tasks.register(handle, &task_labels);
    }

    /// Spawns every configured task and blocks until cancellation has
    /// propagated through all of them.
    pub async fn run(mut self) -> Result<(), Error> {
        let device_id = self.config.device.id.clone();

        for metric in self.config.metrics.iter().filter(|m| m.enabled) {
            let Some(collector) = build_collector(&metric.name, &device_id) else {
                tracing::warn!(metric = %metric.name, "no built-in collector for this metric name; skipping");
                continue;
            };
            let name = metric.name.clone();
            let interval = metric.interval;
            let store = self.store.clone();
            let health = self.health.clone();
            let cancel = self.cancel.clone();
            self.spawn("collector", &name.clone(), tasks::collector_task(name, collector, interval, store, health, cancel));
        }

        {
            let store = self.store.clone();
            let storage = self.config.storage.clone();
            let health = self.health.clone();
            let cancel = self.cancel.clone();
            self.spawn("checkpoint", "wal", tasks::checkpoint_task(store, storage, health, cancel));
        }

        {
            let store = self.store.clone();
            let cancel = self.cancel.clone();
            let device_id = device_id.clone();
            self.spawn("self-telemetry", "agent", tasks::self_telemetry_task(device_id, store, cancel));
        }

        if self.config.remote.enabled {
            let remote = self.config.remote.clone();
            let store = self.store.clone();
            let health = self.health.clone();
            let cancel = self.cancel.clone();
            let device_id = device_id.clone();
            self.spawn("uploader", "remote", async move {
                if let Err(err) = tasks::uploader_task(remote, device_id, store, health, cancel).await {
                    tracing::error!(error = %err, "uploader task exited");
                }
            });
        }

        if self.config.monitoring.clock_skew_url.is_some() {
            let monitoring = self.config.monitoring.clone();
            let remote = self.config.remote.clone();
            let store = self.store.clone();
            let health = self.health.clone();
            let cancel = self.cancel.clone();
            let device_id = device_id.clone();
            let upload_period = self.config.remote.upload_interval;
            self.spawn("clockskew", "probe", async move {
                if let Err(err) = tasks::clockskew_task(monitoring, remote, device_id, store, health, upload_period, cancel).await {
                    tracing::error!(error = %err, "clock-skew task exited");
                }
            });
        }

        {
            let health = self.health.clone();
            let cancel = self.cancel.clone();
            let bind_address = self.config.monitoring.health_address.clone();
            self.spawn("health", "server", async move {
                if let Err(err) = health::serve(&bind_address, health, cancel).await {
                    tracing::error!(error = %err, "health server exited");
                }
            });
        }

        {
            let notifier = Arc::clone(&self.notifier);
            let cancel = self.cancel.clone();
            self.spawn("notify", "watchdog", async move {
                notifier.run_keepalive(cancel).await;
            });
        }

        self.notifier.ready();
        self.tasks.join().await;
        self.notifier.stopping();
        Ok(())
    }
}

/// Maps a configured metric name to its built-in collector, if any.
fn build_collector(name: &str, device_id: &str) -> Option<Box<dyn Collector>> {
    match name {
        "cpu.load" => Some(Box::new(CpuLoadCollector::new(device_id))),
        "memory.used" => Some(Box::new(MemoryUsedCollector::new(device_id))),
        "disk.free_bytes" => Some(Box::new(DiskFreeBytesCollector::new(device_id))),
        "network.bytes" => Some(Box::new(NetworkBytesCollector::new(device_id))),
        "system.thermal_celsius" => Some(Box::new(ThermalCollector::new(device_id))),
        "stream.loss_ratio" => Some(Box::new(StreamLossCollector::new(device_id))),
        _ => None,
    }
}
