use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineSettings};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::store::WalStore;
use crate::sweeper;

/// One named data partition: its store and the engine over it.
pub struct PartitionHandle {
    pub name: String,
    pub engine: Arc<Engine>,
    pub store: Arc<WalStore>,
}

/// Manages per-partition stores (`default`, `test`, ...). Each partition gets its
/// own WAL, engine and background tasks.
pub struct PartitionManager {
    /// Keyed by sanitized name.
    partitions: DashMap<String, Arc<PartitionHandle>>,
    create_lock: Mutex<()>,
    data_dir: PathBuf,
    settings: EngineSettings,
    compact_threshold: u64,
    /// `None` disables the periodic sweeper.
    sweep_interval: Option<Duration>,
    shutdown: CancellationToken,
}

impl PartitionManager {
    pub fn new(
        data_dir: PathBuf,
        settings: EngineSettings,
        compact_threshold: u64,
        sweep_interval: Option<Duration>,
    ) -> Self {
        Self {
            partitions: DashMap::new(),
            create_lock: Mutex::new(()),
            data_dir,
            settings,
            compact_threshold,
            sweep_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get or lazily open a partition.
    ///
    /// Names are keyed by their sanitized form, so `"a.b"` and `"ab"` share one
    /// partition, just as they share one WAL file.
    pub fn get_or_create(&self, name: &str) -> std::io::Result<Arc<PartitionHandle>> {
        if name.len() > MAX_PARTITION_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "partition name too long",
            ));
        }
        // Sanitize partition name to prevent path traversal
        let safe_name: String = name
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty partition name",
            ));
        }
        if let Some(handle) = self.partitions.get(&safe_name) {
            return Ok(handle.value().clone());
        }

        // One opener at a time; a racing caller finds the winner's handle
        let _creating = self
            .create_lock
            .lock()
            .map_err(|_| std::io::Error::other("partition create lock poisoned"))?;
        if let Some(handle) = self.partitions.get(&safe_name) {
            return Ok(handle.value().clone());
        }
        if self.partitions.len() >= MAX_PARTITIONS {
            return Err(std::io::Error::other("too many partitions"));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let store = Arc::new(WalStore::open(&wal_path)?);
        let engine = Arc::new(Engine::new(
            store.clone(),
            store.clone(),
            Arc::new(NotifyHub::new()),
            self.settings.clone(),
        ));
        let handle = Arc::new(PartitionHandle {
            name: safe_name.clone(),
            engine: engine.clone(),
            store: store.clone(),
        });

        // Compactor always, sweeper if configured
        let threshold = self.compact_threshold;
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            sweeper::run_compactor(store, threshold, cancel).await;
        });
        if let Some(every) = self.sweep_interval {
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                sweeper::run_sweeper(engine, every, cancel).await;
            });
        }

        self.partitions.insert(safe_name.clone(), handle.clone());
        metrics::gauge!(crate::observability::PARTITIONS_ACTIVE).set(self.partitions.len() as f64);
        tracing::info!(partition = %safe_name, path = %wal_path.display(), "partition opened");
        Ok(handle)
    }

    /// Stop every partition's background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
