//! Persistent local store
//!
//! A single JSON file holds the client record, jobs by name and queues by
//! name. The in-memory copy is authoritative: every mutation is applied under
//! the store lock and flushed with a crash-safe write before the lock is
//! released. A failed flush leaves the mutation in memory and is reported to
//! the caller, who logs it and carries on. Async callers mutate through
//! [`Store::blocking`] so the flush runs on the blocking pool.

mod file;
mod records;

pub use records::{
    ClientPatch, ClientRecord, JobPatch, JobRecord, QueuePatch, QueueRecord, StoreData,
};

use crate::error::StoreError;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Which records a frequency query returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyFilter<'a> {
    /// Frequency equals the given value (e.g. `first_boot`)
    Exact(&'a str),
    /// Frequency is one of the periodic cadences
    Scheduled,
}

impl FrequencyFilter<'_> {
    fn matches(&self, frequency: &str) -> bool {
        match self {
            FrequencyFilter::Exact(value) => frequency == *value,
            FrequencyFilter::Scheduled => udpu_shared::Frequency::parse(frequency).is_periodic(),
        }
    }
}

pub struct Store {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl Store {
    /// Load the store from `path`, creating an empty one if absent.
    ///
    /// A file that fails strict decoding is copied to `<path>.bak.<unix>`
    /// and reported as [`StoreError::Corrupt`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let data = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<StoreData>(&bytes) {
                Ok(data) => data,
                Err(source) => {
                    let backup = match file::backup_corrupt(&path) {
                        Ok(backup) => {
                            warn!("Corrupt store backed up to {}", backup.display());
                            Some(backup)
                        }
                        Err(e) => {
                            error!("Failed to back up corrupt store {}: {}", path.display(), e);
                            None
                        }
                    };
                    return Err(StoreError::Corrupt {
                        path,
                        backup,
                        source,
                    });
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No store at {}, initializing", path.display());
                let data = StoreData::default();
                persist(&path, &data)?;
                data
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            "Store loaded: {} jobs, {} queues",
            data.jobs.len(),
            data.queues.len()
        );

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the whole in-memory state
    pub fn snapshot(&self) -> StoreData {
        self.lock().clone()
    }

    // ---------------------------------------------------------------- client

    /// The client record, if one has been created
    pub fn client(&self) -> Option<ClientRecord> {
        let data = self.lock();
        data.client.exists().then(|| data.client.clone())
    }

    pub fn client_name(&self) -> Option<String> {
        let data = self.lock();
        Some(data.client.name.clone()).filter(|name| !name.is_empty())
    }

    /// Merge `patch` into the single client record, creating it if needed
    pub fn upsert_client(&self, patch: &ClientPatch) -> Result<ClientRecord, StoreError> {
        self.mutate(|data| {
            data.client.apply(patch);
            data.client.clone()
        })
    }

    /// Set the client name, creating the record on first use
    pub fn set_client_name(&self, name: &str) -> Result<(), StoreError> {
        if name.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        if self.lock().client.name == name {
            return Ok(());
        }
        self.upsert_client(&ClientPatch::name(name)).map(|_| ())
    }

    /// Clear the client record if its name matches
    pub fn delete_client(&self, name: &str) -> Result<bool, StoreError> {
        self.mutate(|data| {
            if data.client.exists() && data.client.name == name {
                data.client = ClientRecord::default();
                true
            } else {
                info!("Can't delete client: {} not found", name);
                false
            }
        })
    }

    pub fn secret_key(&self) -> Option<String> {
        let data = self.lock();
        Some(data.client.udpu_secret_key.clone()).filter(|key| !key.is_empty())
    }

    pub fn set_secret_key(&self, key: &str) -> Result<(), StoreError> {
        self.upsert_client(&ClientPatch {
            secret_key: Some(key.to_string()),
            ..Default::default()
        })
        .map(|_| ())
    }

    // ------------------------------------------------------------------ jobs

    pub fn job(&self, name: &str) -> Option<JobRecord> {
        self.lock().jobs.get(name).cloned()
    }

    /// Merge `patch` into the job named `name`, creating it if absent
    pub fn upsert_job(&self, name: &str, patch: &JobPatch) -> Result<JobRecord, StoreError> {
        if name.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        self.mutate(|data| {
            let job = data.jobs.entry(name.to_string()).or_insert_with(|| JobRecord {
                name: name.to_string(),
                ..Default::default()
            });
            job.apply(patch);
            job.clone()
        })
    }

    pub fn delete_job(&self, name: &str) -> Result<bool, StoreError> {
        if !self.lock().jobs.contains_key(name) {
            info!("Can't delete job: {} not found", name);
            return Ok(false);
        }
        self.mutate(|data| data.jobs.remove(name).is_some())
    }

    pub fn jobs_matching(&self, filter: FrequencyFilter<'_>) -> Vec<JobRecord> {
        self.lock()
            .jobs
            .values()
            .filter(|job| filter.matches(&job.frequency))
            .cloned()
            .collect()
    }

    // ---------------------------------------------------------------- queues

    pub fn queue(&self, name: &str) -> Option<QueueRecord> {
        self.lock().queues.get(name).cloned()
    }

    pub fn upsert_queue(&self, name: &str, patch: &QueuePatch) -> Result<QueueRecord, StoreError> {
        if name.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        self.mutate(|data| {
            let queue = data
                .queues
                .entry(name.to_string())
                .or_insert_with(|| QueueRecord {
                    name: name.to_string(),
                    ..Default::default()
                });
            queue.apply(patch);
            queue.clone()
        })
    }

    pub fn delete_queue(&self, name: &str) -> Result<bool, StoreError> {
        if !self.lock().queues.contains_key(name) {
            info!("Can't delete queue: {} not found", name);
            return Ok(false);
        }
        self.mutate(|data| data.queues.remove(name).is_some())
    }

    pub fn queues_matching(&self, filter: FrequencyFilter<'_>) -> Vec<QueueRecord> {
        self.lock()
            .queues
            .values()
            .filter(|queue| filter.matches(&queue.frequency))
            .cloned()
            .collect()
    }

    /// Run `f` against the store on the blocking pool
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }

    // -------------------------------------------------------------- internal

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` and flush while still holding the lock
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> Result<T, StoreError> {
        let mut data = self.lock();
        let out = f(&mut data);
        persist(&self.path, &data)?;
        Ok(out)
    }
}

fn persist(path: &Path, data: &StoreData) -> Result<(), StoreError> {
    let mut bytes = serde_json::to_vec_pretty(data).map_err(StoreError::Encode)?;
    bytes.push(b'\n');
    file::write_atomic(path, &bytes)?;
    Ok(())
}
