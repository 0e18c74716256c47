//! Directory-backed long-poll store
//!
//! Files are published once under their final name and never change afterwards.
//! Readers either get the file immediately or park a waiter until it shows up or a
//! timeout elapses. Waiters are woken by in-process publishes and by a periodic
//! rescan that picks up files written by other processes.

use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};
use uuid::Uuid;

/// Default interval between directory rescans
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Result of waiting for a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The file exists, with its full contents
    Ready(Bytes),
    /// The wait timed out; the caller should ask again
    TryAgain,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Bytes>,
}

struct Inner {
    dir: PathBuf,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    next_waiter: AtomicU64,
    rescan_interval: Duration,
}

struct WaiterGuard<'a> {
    store: &'a LongPollStore,
    name: &'a str,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.store.remove_waiter(self.name, self.id);
    }
}

/// Publish/subscribe over immutable files in one directory
#[derive(Clone)]
pub struct LongPollStore {
    inner: Arc<Inner>,
}

impl LongPollStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_rescan_interval(dir, DEFAULT_RESCAN_INTERVAL).await
    }

    pub async fn with_rescan_interval(
        dir: impl Into<PathBuf>,
        rescan_interval: Duration,
    ) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                waiters: Mutex::new(HashMap::new()),
                next_waiter: AtomicU64::new(0),
                rescan_interval,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(Error::format(format!("invalid store file name {:?}", name)));
        }
        Ok(self.inner.dir.join(name))
    }

    /// Whether `name` has been published
    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path(name)?).await?)
    }

    /// Read a published file, `None` if it does not exist yet
    pub async fn read(&self, name: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path(name)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically publish `data` under `name` and wake its waiters
    ///
    /// The data is written to a temporary file in the same directory and renamed
    /// into place, so a reader never sees a partial file.
    pub async fn publish(&self, name: &str, data: Bytes) -> Result<()> {
        let target = self.path(name)?;
        let tmp = self
            .inner
            .dir
            .join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(name, bytes = data.len(), "published");
        self.fulfill(name, data);
        Ok(())
    }

    /// Wait up to `timeout` for `name` to be published
    pub async fn await_file(&self, name: &str, timeout: Duration) -> Result<PollOutcome> {
        if let Some(data) = self.read(name).await? {
            return Ok(PollOutcome::Ready(data));
        }

        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        self.inner
            .waiters
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(Waiter { id, tx });
        // Deregisters on every exit path, including a dropped request future
        let _guard = WaiterGuard {
            store: self,
            name,
            id,
        };

        // The file may have landed between the first read and registration
        if let Some(data) = self.read(name).await? {
            return Ok(PollOutcome::Ready(data));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(PollOutcome::Ready(data)),
            Ok(Err(_)) => Ok(PollOutcome::TryAgain),
            Err(_) => {
                trace!(name, "long-poll timed out");
                Ok(PollOutcome::TryAgain)
            }
        }
    }

    /// Number of parked waiters for `name`
    pub fn waiter_count(&self, name: &str) -> usize {
        self.inner
            .waiters
            .lock()
            .get(name)
            .map_or(0, Vec::len)
    }

    fn remove_waiter(&self, name: &str, id: u64) {
        let mut waiters = self.inner.waiters.lock();
        if let Some(list) = waiters.get_mut(name) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                waiters.remove(name);
            }
        }
    }

    fn fulfill(&self, name: &str, data: Bytes) {
        let waiters = self.inner.waiters.lock().remove(name);
        if let Some(waiters) = waiters {
            debug!(name, count = waiters.len(), "waking waiters");
            for waiter in waiters {
                // A dropped receiver means the waiter already gave up
                let _ = waiter.tx.send(data.clone());
            }
        }
    }

    /// Re-check every name that has waiters and wake those whose file now exists
    ///
    /// A missing file keeps its waiters parked. Any other read failure is returned.
    pub async fn check(&self) -> Result<()> {
        let names: Vec<String> = self.inner.waiters.lock().keys().cloned().collect();
        for name in names {
            if let Some(data) = self.read(&name).await? {
                self.fulfill(&name, data);
            }
        }
        Ok(())
    }

    /// Spawn the rescan task; it ends on cancellation or on a fatal read error
    pub fn spawn_watcher(&self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.inner.rescan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        if let Err(e) = store.check().await {
                            error!("long-poll store rescan of {} failed: {}", store.dir().display(), e);
                            return Err(e);
                        }
                    }
                }
            }
        })
    }
}
