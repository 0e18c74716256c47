//! Pool client
//!
//! Mirrors the master's current work over plain HTTP. The config document is
//! polled on a fixed interval to detect connectivity and height jumps, while a
//! long-poll loop asks for `work_<height+1>.bin` so new work arrives as soon as
//! the master publishes it. Consumers read the cached state or subscribe to
//! [`PoolEvent`]s.

use crate::types::{template_file_name, work_file_name, BlockTemplate, PoolConfigDoc, Work};
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::{Client, ClientBuilder, StatusCode};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Header the master sets on a long-poll that timed out
pub const LONGPOLL_HEADER: &str = "x-pc-longpoll";
/// Value of [`LONGPOLL_HEADER`] asking the client to poll again
pub const LONGPOLL_TRY_AGAIN: &str = "try-again";

/// Tuning for a [`PoolClient`]
#[derive(Debug, Clone)]
pub struct PoolClientOptions {
    /// Base URL of the master, e.g. `http://master:8080/`
    pub master_url: Url,
    /// Interval between config document polls
    pub poll_interval: Duration,
    /// Silence after which the client declares itself disconnected
    pub disconnect_deadline: Duration,
    /// Delay between failed binary fetches
    pub retry_delay: Duration,
    /// Heights kept below the current one; 0 keeps everything
    pub retain_heights: u32,
    /// Per-request timeout, must exceed the master's long-poll timeout
    pub request_timeout: Duration,
}

impl PoolClientOptions {
    pub fn new(master_url: Url) -> Self {
        Self {
            master_url,
            poll_interval: Duration::from_secs(5),
            disconnect_deadline: Duration::from_secs(15),
            retry_delay: Duration::from_secs(1),
            retain_heights: 20,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Event published to subscribers
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Work(Arc<Work>),
    Connected,
    Disconnected,
}

struct State {
    config: Option<PoolConfigDoc>,
    current_height: u32,
    connected: bool,
    last_work: Option<Arc<Work>>,
    last_success: Option<Instant>,
}

struct Inner {
    http: Client,
    base: Url,
    opts: PoolClientOptions,
    state: RwLock<State>,
    works: DashMap<u32, Arc<Work>>,
    templates: DashMap<u32, Arc<BlockTemplate>>,
    events: broadcast::Sender<PoolEvent>,
}

/// Synchronized mirror of the master's work and block templates
#[derive(Clone)]
pub struct PoolClient {
    inner: Arc<Inner>,
}

/// Event stream that starts with the latest known state
pub struct Subscription {
    replay: VecDeque<PoolEvent>,
    rx: broadcast::Receiver<PoolEvent>,
}

impl Subscription {
    /// Next event, `None` once the client is gone
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("pool event subscriber lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

enum Fetch {
    Ready(Bytes),
    TryAgain,
}

impl PoolClient {
    pub fn new(opts: PoolClientOptions) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(opts.request_timeout)
            .user_agent(format!("pool-coordinator/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        let mut base = opts.master_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base,
                opts,
                state: RwLock::new(State {
                    config: None,
                    current_height: 0,
                    connected: false,
                    last_work: None,
                    last_success: None,
                }),
                works: DashMap::new(),
                templates: DashMap::new(),
                events,
            }),
        })
    }

    /// Spawn the config poller and the work long-poll loop
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            tokio::join!(
                client.config_loop(cancel.clone()),
                client.longpoll_loop(cancel.clone())
            );
            debug!("pool client stopped");
        })
    }

    pub fn subscribe(&self) -> Subscription {
        let state = self.inner.state.read();
        let rx = self.inner.events.subscribe();
        let mut replay = VecDeque::new();
        replay.push_back(if state.connected {
            PoolEvent::Connected
        } else {
            PoolEvent::Disconnected
        });
        if let Some(work) = &state.last_work {
            replay.push_back(PoolEvent::Work(work.clone()));
        }
        Subscription { replay, rx }
    }

    pub fn current_work(&self) -> Option<Arc<Work>> {
        self.inner.state.read().last_work.clone()
    }

    pub fn current_height(&self) -> u32 {
        self.inner.state.read().current_height
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.read().connected
    }

    /// Latest config document served by the master
    pub fn config(&self) -> Option<PoolConfigDoc> {
        self.inner.state.read().config.clone()
    }

    /// Work for `height`, fetched and cached on a miss
    ///
    /// Fetch failures are retried forever with a fixed delay.
    pub async fn get_work_by_num(&self, height: u32) -> Arc<Work> {
        if let Some(work) = self.inner.works.get(&height) {
            return work.clone();
        }
        let name = work_file_name(height);
        loop {
            match self.fetch_snapshot(&name).await.and_then(|b| Work::decode(&b)) {
                Ok(work) => {
                    let work = Arc::new(work);
                    self.inner.works.insert(height, work.clone());
                    return work;
                }
                Err(e) => {
                    warn!("fetching {} failed, retrying: {}", name, e);
                    sleep(self.inner.opts.retry_delay).await;
                }
            }
        }
    }

    /// Block template for `height`, with the same caching as [`Self::get_work_by_num`]
    pub async fn get_template_by_num(&self, height: u32) -> Arc<BlockTemplate> {
        if let Some(bt) = self.inner.templates.get(&height) {
            return bt.clone();
        }
        let name = template_file_name(height);
        loop {
            match self.fetch_snapshot(&name).await.and_then(|b| BlockTemplate::decode(&b)) {
                Ok(bt) => {
                    let bt = Arc::new(bt);
                    self.inner.templates.insert(height, bt.clone());
                    return bt;
                }
                Err(e) => {
                    warn!("fetching {} failed, retrying: {}", name, e);
                    sleep(self.inner.opts.retry_delay).await;
                }
            }
        }
    }

    /// Fetch a snapshot, following long-poll retries until it exists
    async fn fetch_snapshot(&self, name: &str) -> Result<Bytes> {
        loop {
            match self.fetch_once(name).await? {
                Fetch::Ready(bytes) => return Ok(bytes),
                Fetch::TryAgain => continue,
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn fetch_once(&self, name: &str) -> Result<Fetch> {
        let url = self
            .inner
            .base
            .join(name)
            .map_err(|e| Error::config(format!("bad snapshot URL for {}: {}", name, e)))?;
        let response = self.inner.http.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::MULTIPLE_CHOICES {
            let try_again = response
                .headers()
                .get(LONGPOLL_HEADER)
                .is_some_and(|v| v.as_bytes() == LONGPOLL_TRY_AGAIN.as_bytes());
            if try_again {
                return Ok(Fetch::TryAgain);
            }
        }
        if !status.is_success() {
            return Err(Error::network(format!("GET {} returned HTTP {}", name, status)));
        }
        Ok(Fetch::Ready(response.bytes().await?))
    }

    async fn fetch_config(&self) -> Result<PoolConfigDoc> {
        let url = self
            .inner
            .base
            .join("config.json")
            .map_err(|e| Error::config(format!("bad config URL: {}", e)))?;
        let response = self
            .inner
            .http
            .get(url)
            .timeout(self.inner.opts.disconnect_deadline)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn config_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.opts.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let poll = async {
                match self.fetch_config().await {
                    Ok(doc) => self.on_config(doc).await,
                    Err(e) => {
                        debug!("config poll failed: {}", e);
                        self.check_deadline();
                    }
                }
            };
            tokio::pin!(poll);
            // A poll can stall on a work fetch; the deadline still has to be enforced
            let period = self.inner.opts.poll_interval;
            let mut watchdog = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = &mut poll => break,
                    _ = watchdog.tick() => self.check_deadline(),
                }
            }
        }
    }

    async fn on_config(&self, doc: PoolConfigDoc) {
        let (changed, need_work) = {
            let mut state = self.inner.state.write();
            state.last_success = Some(Instant::now());
            let changed = state.config.as_ref() != Some(&doc);
            let need_work = changed || state.last_work.is_none();
            if changed {
                state.config = Some(doc.clone());
            }
            (changed, need_work)
        };
        if changed {
            debug!(height = doc.current_height, "config document changed");
        }

        let work = if need_work {
            Some(self.get_work_by_num(doc.current_height).await)
        } else {
            None
        };

        {
            let mut state = self.inner.state.write();
            if !state.connected {
                state.connected = true;
                info!("connected to master at {}", self.inner.base);
                let _ = self.inner.events.send(PoolEvent::Connected);
            }
        }
        if let Some(work) = work {
            self.accept_work(work);
        }
    }

    fn check_deadline(&self) {
        let mut state = self.inner.state.write();
        let expired = state
            .last_success
            .map_or(true, |t| t.elapsed() > self.inner.opts.disconnect_deadline);
        if state.connected && expired {
            state.connected = false;
            warn!(
                "no config from master in {:?}, disconnected",
                self.inner.opts.disconnect_deadline
            );
            let _ = self.inner.events.send(PoolEvent::Disconnected);
        }
    }

    async fn longpoll_loop(&self, cancel: CancellationToken) {
        let mut sub = self.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = sub.recv() => match event {
                    Some(PoolEvent::Work(_)) => break,
                    Some(_) => continue,
                    None => return,
                }
            }
        }
        drop(sub);

        loop {
            let next = self.current_height() + 1;
            let name = work_file_name(next);
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                r = self.fetch_once(&name) => r,
            };
            match result.and_then(|fetch| match fetch {
                Fetch::Ready(bytes) => Work::decode(&bytes).map(Some),
                Fetch::TryAgain => Ok(None),
            }) {
                Ok(Some(work)) => {
                    let work = Arc::new(work);
                    self.inner.works.insert(work.height(), work.clone());
                    self.accept_work(work);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("long-poll for {} failed: {}", name, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(self.inner.opts.retry_delay) => {}
                    }
                }
            }
        }
    }

    /// Make `work` current if it is not older than what we have; returns whether it was
    pub(crate) fn accept_work(&self, work: Arc<Work>) -> bool {
        let mut state = self.inner.state.write();
        let is_new = state
            .last_work
            .as_ref()
            .map_or(true, |last| last.height() != work.height() || **last != *work);
        if work.height() < state.current_height || !is_new {
            return false;
        }
        let advanced = work.height() > state.current_height || state.last_work.is_none();
        state.current_height = work.height();
        state.last_work = Some(work.clone());
        self.inner.works.insert(work.height(), work.clone());
        info!(height = work.height(), "new work");
        let _ = self.inner.events.send(PoolEvent::Work(work));
        if advanced {
            self.prune(state.current_height);
        }
        true
    }

    /// Seed the template cache
    pub(crate) fn insert_template(&self, template: BlockTemplate) {
        self.inner.templates.insert(template.height, Arc::new(template));
    }

    /// Drop cached heights below the retention window
    fn prune(&self, current: u32) {
        let keep = self.inner.opts.retain_heights;
        if keep == 0 {
            return;
        }
        let floor = current.saturating_sub(keep);
        self.inner.works.retain(|h, _| *h >= floor);
        self.inner.templates.retain(|h, _| *h >= floor);
    }

    /// Heights currently cached, for inspection
    pub fn cached_work_heights(&self) -> Vec<u32> {
        let mut heights: Vec<u32> = self.inner.works.iter().map(|e| *e.key()).collect();
        heights.sort_unstable();
        heights
    }
}
