//! Master work producer
//!
//! The master is the single writer of pool work. For every height the chain
//! daemon reports it builds one `Work` and one `BlockTemplate`, persists both to
//! the long-poll store and swaps them in as the live state. Consumers fetch
//! snapshots over HTTP; a request for the next height parks until it exists.

use crate::client::{LONGPOLL_HEADER, LONGPOLL_TRY_AGAIN};
use crate::crypto::derive_signing_key;
use crate::longpoll::{LongPollStore, PollOutcome};
use crate::rpc::ChainRpc;
use crate::types::{
    display_hash, parse_snapshot_name, template_file_name, work_file_name, BlockTemplate,
    PoolConfigDoc, Work,
};
use crate::{Error, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const CONFIG_CACHE_CONTROL: &str = "max-age=8, stale-while-revalidate=2";
const SNAPSHOT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Settings for a [`Master`]
#[derive(Debug, Clone)]
pub struct MasterOptions {
    pub private_seed: Vec<u8>,
    pub share_target: u32,
    pub ann_target: u32,
    /// URL under which this master is reachable, advertised in `config.json`
    pub public_url: String,
    pub submit_ann_urls: Vec<String>,
    pub download_ann_urls: Vec<String>,
    pub submit_block_urls: Vec<String>,
    pub longpoll_timeout: Duration,
    pub template_retry: Duration,
    pub tip_retry: Duration,
    pub persist_retry: Duration,
}

impl MasterOptions {
    pub fn new(private_seed: Vec<u8>, share_target: u32, ann_target: u32) -> Self {
        Self {
            private_seed,
            share_target,
            ann_target,
            public_url: String::new(),
            submit_ann_urls: Vec::new(),
            download_ann_urls: Vec::new(),
            submit_block_urls: Vec::new(),
            longpoll_timeout: Duration::from_secs(30),
            template_retry: Duration::from_secs(10),
            tip_retry: Duration::from_millis(100),
            persist_retry: Duration::from_secs(1),
        }
    }
}

/// Live snapshot served by the master
pub struct MasterState {
    pub work: Arc<Work>,
    pub signing_key: SigningKey,
    pub template: Arc<BlockTemplate>,
}

pub struct Master {
    rpc: Arc<dyn ChainRpc>,
    store: LongPollStore,
    opts: MasterOptions,
    state: RwLock<Option<Arc<MasterState>>>,
    refresh_lock: Mutex<()>,
}

impl Master {
    pub fn new(rpc: Arc<dyn ChainRpc>, store: LongPollStore, opts: MasterOptions) -> Self {
        Self {
            rpc,
            store,
            opts,
            state: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> Option<Arc<MasterState>> {
        self.state.read().clone()
    }

    pub fn store(&self) -> &LongPollStore {
        &self.store
    }

    /// Current topology document; not available before the first refresh
    pub fn config_doc(&self) -> Result<PoolConfigDoc> {
        let state = self
            .state()
            .ok_or_else(|| Error::not_ready("master has no work yet"))?;
        Ok(PoolConfigDoc {
            current_height: state.work.height(),
            master_url: self.opts.public_url.clone(),
            submit_ann_urls: self.opts.submit_ann_urls.clone(),
            download_ann_urls: self.opts.download_ann_urls.clone(),
            submit_block_urls: self.opts.submit_block_urls.clone(),
            version: 1,
        })
    }

    /// Fetch a template and make its work live
    ///
    /// Snapshots already on disk for the height win over freshly computed ones, so
    /// a restarted master republishes exactly what it served before.
    pub async fn refresh_once(&self) -> Result<Arc<MasterState>> {
        let _guard = self.refresh_lock.lock().await;

        let raw = self.rpc.get_raw_block_template().await?;
        let height = raw.height;
        let signing_key = derive_signing_key(&self.opts.private_seed, height);

        let template_name = template_file_name(height);
        let template = match self.store.read(&template_name).await? {
            Some(bytes) => {
                debug!(height, "reusing persisted block template");
                BlockTemplate::decode(&bytes).map_err(|e| {
                    Error::fatal(format!("persisted {} is corrupt: {}", template_name, e))
                })?
            }
            None => {
                let template = raw.into_template()?;
                self.persist(&template_name, template.encode()?).await;
                template
            }
        };

        let work_name = work_file_name(height);
        let work = match self.store.read(&work_name).await? {
            Some(bytes) => {
                debug!(height, "reusing persisted work");
                Work::decode(&bytes).map_err(|e| {
                    Error::fatal(format!("persisted {} is corrupt: {}", work_name, e))
                })?
            }
            None => {
                let work = Work::new(
                    template.header,
                    signing_key.verifying_key().to_bytes(),
                    self.opts.share_target,
                    self.opts.ann_target,
                    height,
                    template.coinbase.clone(),
                    template.merkle_branch.clone(),
                );
                self.persist(&work_name, work.to_bytes()).await;
                work
            }
        };

        if let Some(previous) = self.state() {
            if work.height() <= previous.work.height() {
                warn!(
                    "height went from {} to {}",
                    previous.work.height(),
                    work.height()
                );
            }
        }

        let state = Arc::new(MasterState {
            work: Arc::new(work),
            signing_key,
            template: Arc::new(template),
        });
        *self.state.write() = Some(state.clone());
        info!(
            height,
            parent = %display_hash(&state.work.last_hash()),
            "new work"
        );
        Ok(state)
    }

    /// Publish a snapshot, retrying until the store accepts it
    async fn persist(&self, name: &str, data: Bytes) {
        loop {
            match self.store.publish(name, data.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    error!("persisting {} failed, retrying: {}", name, e);
                    sleep(self.opts.persist_retry).await;
                }
            }
        }
    }

    /// [`Self::refresh_once`] retried until it succeeds
    ///
    /// Chain daemon and transport failures are retried; anything else, such as a
    /// corrupt persisted snapshot, ends the loop.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<Arc<MasterState>> {
        loop {
            match self.refresh_once().await {
                Ok(state) => return Ok(state),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        "getting block template failed, retrying in {:?}: {}",
                        self.opts.template_retry, e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::cancelled("master refresh")),
                        _ = sleep(self.opts.template_retry) => {}
                    }
                }
            }
        }
    }

    /// Follow the chain tip until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        match self.refresh(&cancel).await {
            Ok(_) => {}
            Err(Error::Cancelled { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut longpoll_id: Option<String> = None;
        let mut failing = false;
        loop {
            let tip = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                tip = self.rpc.wait_for_tip(longpoll_id.clone()) => tip,
            };
            match tip {
                Ok(tip) => {
                    if failing {
                        info!("chain daemon long-poll recovered");
                        failing = false;
                    }
                    longpoll_id = tip.longpoll_id;
                    let published = self.state().map(|s| s.work.last_hash());
                    if published != Some(tip.previous_block_hash) {
                        debug!(tip = %display_hash(&tip.previous_block_hash), "tip changed");
                        match self.refresh(&cancel).await {
                            Ok(_) => {}
                            Err(Error::Cancelled { .. }) => return Ok(()),
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(e) => {
                    if !failing {
                        warn!("chain daemon long-poll failing: {}", e);
                        failing = true;
                    }
                    longpoll_id = None;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = sleep(self.opts.tip_retry) => {}
                    }
                }
            }
        }
    }

    /// HTTP surface: `config.json`, `work_<h>.bin` and `bt_<h>.bin`
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/config.json", get(config_handler))
            .route("/{file}", get(snapshot_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    async fn snapshot(&self, file: &str) -> Result<Response> {
        let Some((_, height)) = parse_snapshot_name(file) else {
            return Ok(StatusCode::NOT_FOUND.into_response());
        };
        let current = self
            .state()
            .ok_or_else(|| Error::not_ready("master has no work yet"))?
            .work
            .height();

        let data = if height <= current {
            match self.store.read(file).await? {
                Some(data) => data,
                None => return Ok(StatusCode::NOT_FOUND.into_response()),
            }
        } else if height == current + 1 {
            match self.store.await_file(file, self.opts.longpoll_timeout).await? {
                PollOutcome::Ready(data) => data,
                PollOutcome::TryAgain => {
                    return Ok((
                        StatusCode::MULTIPLE_CHOICES,
                        [(LONGPOLL_HEADER, LONGPOLL_TRY_AGAIN)],
                    )
                        .into_response());
                }
            }
        } else {
            return Ok(StatusCode::NOT_FOUND.into_response());
        };

        Ok((
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
                (header::CACHE_CONTROL, HeaderValue::from_static(SNAPSHOT_CACHE_CONTROL)),
            ],
            data,
        )
            .into_response())
    }
}

async fn config_handler(State(master): State<Arc<Master>>) -> Result<Response> {
    let doc = master.config_doc()?;
    Ok((
        [(header::CACHE_CONTROL, HeaderValue::from_static(CONFIG_CACHE_CONTROL))],
        Json(doc),
    )
        .into_response())
}

async fn snapshot_handler(
    State(master): State<Arc<Master>>,
    Path(file): Path<String>,
) -> Result<Response> {
    master.snapshot(&file).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::{raw_template, MockRpc};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn options() -> MasterOptions {
        let mut opts = MasterOptions::new(b"seed".to_vec(), 0x2000ffff, 0x207fffff);
        opts.public_url = "http://master.example/".to_string();
        opts.longpoll_timeout = Duration::from_millis(50);
        opts.template_retry = Duration::from_millis(10);
        opts
    }

    async fn master(dir: &TempDir, rpc: Arc<MockRpc>) -> Arc<Master> {
        let store = LongPollStore::open(dir.path()).await.unwrap();
        Arc::new(Master::new(rpc, store, options()))
    }

    async fn get(router: Router, uri: &str) -> Response {
        router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_builds_and_persists_work() {
        let dir = TempDir::new().unwrap();
        let rpc = Arc::new(MockRpc::new(raw_template(100, [7; 32])));
        let master = master(&dir, rpc.clone()).await;

        let state = master.refresh_once().await.unwrap();
        assert_eq!(state.work.height(), 100);
        assert_eq!(state.work.last_hash(), [7; 32]);
        assert_eq!(state.work.share_target(), 0x2000ffff);
        assert_eq!(
            state.work.signing_key(),
            &crate::crypto::derive_public_key(b"seed", 100)
        );
        assert_eq!(state.work.proof(), &state.template.merkle_branch[..]);

        let on_disk = std::fs::read(dir.path().join("work_100.bin")).unwrap();
        assert_eq!(on_disk, state.work.to_bytes());
        assert!(dir.path().join("bt_100.bin").exists());
    }

    #[tokio::test]
    async fn test_persisted_snapshots_are_reused_verbatim() {
        let dir = TempDir::new().unwrap();
        let rpc = Arc::new(MockRpc::new(raw_template(5, [1; 32])));

        // A previous run used different targets for this height
        let mut previous = options();
        previous.share_target = 0x1d00ffff;
        let store = LongPollStore::open(dir.path()).await.unwrap();
        let first = Master::new(rpc.clone(), store, previous);
        let old = first.refresh_once().await.unwrap();
        let old_work = std::fs::read(dir.path().join("work_5.bin")).unwrap();
        let old_bt = std::fs::read(dir.path().join("bt_5.bin")).unwrap();

        let restarted = master(&dir, rpc).await;
        let state = restarted.refresh_once().await.unwrap();
        assert_eq!(state.work.to_bytes(), old.work.to_bytes());
        assert_eq!(state.work.share_target(), 0x1d00ffff);
        assert_eq!(std::fs::read(dir.path().join("work_5.bin")).unwrap(), old_work);
        assert_eq!(std::fs::read(dir.path().join("bt_5.bin")).unwrap(), old_bt);
    }

    #[tokio::test]
    async fn test_refresh_retries_upstream_errors() {
        let dir = TempDir::new().unwrap();
        let rpc = Arc::new(MockRpc::new(raw_template(9, [2; 32])));
        rpc.fail_templates.store(2, Ordering::SeqCst);
        let master = master(&dir, rpc.clone()).await;

        let state = master.refresh(&CancellationToken::new()).await.unwrap();
        assert_eq!(state.work.height(), 9);
        assert_eq!(rpc.template_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refresh_retries_garbled_template() {
        let dir = TempDir::new().unwrap();
        let rpc = Arc::new(MockRpc::new(raw_template(12, [2; 32])));
        rpc.template.lock().header = "not hex".to_string();
        let master = master(&dir, rpc.clone()).await;

        let refresh = tokio::spawn({
            let master = master.clone();
            async move { master.refresh(&CancellationToken::new()).await }
        });
        while rpc.template_calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!refresh.is_finished());
        assert!(master.state().is_none());

        *rpc.template.lock() = raw_template(12, [2; 32]);
        let state = refresh.await.unwrap().unwrap();
        assert_eq!(state.work.height(), 12);
    }

    #[tokio::test]
    async fn test_refresh_stops_on_corrupt_snapshot() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bt_13.bin"), b"garbage").unwrap();
        let rpc = Arc::new(MockRpc::new(raw_template(13, [2; 32])));
        let master = master(&dir, rpc.clone()).await;

        let result = master.refresh(&CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Fatal { .. })));
        assert_eq!(rpc.template_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_config_document() {
        let dir = TempDir::new().unwrap();
        let rpc = Arc::new(MockRpc::new(raw_template(42, [3; 32])));
        let master = master(&dir, rpc).await;

        let resp = get(master.clone().router(), "/config.json").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        master.refresh_once().await.unwrap();
        let resp = get(master.clone().router(), "/config.json").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CACHE_CONTROL],
            "max-age=8, stale-while-revalidate=2"
        );
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let doc: PoolConfigDoc = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc.current_height, 42);
        assert_eq!(doc.master_url, "http://master.example/");
    }

    #[tokio::test]
    async fn test_snapshot_routes() {
        let dir = TempDir::new().unwrap();
        let rpc = Arc::new(MockRpc::new(raw_template(10, [4; 32])));
        let master = master(&dir, rpc).await;
        let state = master.refresh_once().await.unwrap();

        let resp = get(master.clone().router(), "/work_10.bin").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CACHE_CONTROL],
            "public, max-age=31536000, immutable"
        );
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, state.work.to_bytes());

        let resp = get(master.clone().router(), "/bt_10.bin").await;
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(BlockTemplate::decode(&body).unwrap(), *state.template);

        // Next height long-polls and times out with a retry signal
        let resp = get(master.clone().router(), "/work_11.bin").await;
        assert_eq!(resp.status(), StatusCode::MULTIPLE_CHOICES);
        assert_eq!(resp.headers()[LONGPOLL_HEADER], LONGPOLL_TRY_AGAIN);

        assert_eq!(get(master.clone().router(), "/work_12.bin").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get(master.clone().router(), "/work_9.bin").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get(master.clone().router(), "/other.txt").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_follows_tip() {
        let dir = TempDir::new().unwrap();
        let rpc = Arc::new(MockRpc::new(raw_template(20, [5; 32])));
        let master = master(&dir, rpc.clone()).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(master.clone().run(cancel.clone()));

        let waiter = {
            let store = master.store().clone();
            tokio::spawn(async move {
                loop {
                    if let PollOutcome::Ready(b) =
                        store.await_file("work_21.bin", Duration::from_secs(5)).await.unwrap()
                    {
                        return b;
                    }
                }
            })
        };
        while master.state().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        rpc.advance(raw_template(21, [6; 32]));

        let bytes = waiter.await.unwrap();
        let work = Work::decode(&bytes).unwrap();
        assert_eq!(work.height(), 21);
        assert_eq!(work.last_hash(), [6; 32]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
