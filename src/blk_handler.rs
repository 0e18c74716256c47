//! Block share handler
//!
//! Receives shares from block miners, checks them against pool policy that the
//! miners cannot enforce themselves, rebuilds the candidate block and hands it
//! to the chain daemon. Handlers are sharded: each one only accepts shares whose
//! content-proof index falls in its residue class.

use crate::client::PoolClient;
use crate::codec::{entity, write_entity, write_varint, CoinbaseCommit, HeaderAndProof};
use crate::content::ContentStore;
use crate::crypto::{content_proof_index, derive_signing_key, share_id, sign_announcement};
use crate::merkle;
use crate::rpc::{ChainRpc, CheckShareRequest, ShareCheck};
use crate::types::{display_hash, BlockTemplate, Work};
use crate::{Error, Result};
use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;

/// Header carrying the miner's payout address
pub const PAYTO_HEADER: &str = "x-pc-payto";

/// Coinbase bytes the commitment is patched over: `OP_RETURN PUSH(48)`, the
/// commit magic, then 44 filler bytes
pub fn commit_placeholder() -> [u8; 2 + CoinbaseCommit::SIZE] {
    let mut out = [0xfc; 2 + CoinbaseCommit::SIZE];
    out[0] = 0x6a;
    out[1] = 0x30;
    out[2..6].copy_from_slice(&CoinbaseCommit::MAGIC);
    out
}

/// Replace the placeholder in `coinbase` with `commit`
pub fn patch_coinbase(coinbase: &[u8], commit: &CoinbaseCommit) -> Result<Vec<u8>> {
    let placeholder = commit_placeholder();
    let pos = coinbase
        .windows(placeholder.len())
        .position(|w| w == placeholder)
        .ok_or_else(|| Error::fatal("coinbase has no commitment placeholder"))?;
    let mut out = coinbase.to_vec();
    out[pos + 2..pos + placeholder.len()].copy_from_slice(&commit.encode());
    Ok(out)
}

/// Settings for a [`BlkHandler`]
#[derive(Debug, Clone)]
pub struct BlkHandlerOptions {
    pub hash_num: u32,
    pub hash_mod: u32,
    pub private_seed: Vec<u8>,
    pub max_body_size: usize,
    pub paymaker_url: Option<Url>,
    /// Bound on waiting for work or templates from the master
    pub lookup_timeout: Duration,
}

impl BlkHandlerOptions {
    pub fn new(hash_num: u32, hash_mod: u32, private_seed: Vec<u8>) -> Self {
        Self {
            hash_num,
            hash_mod,
            private_seed,
            max_body_size: 64 * 1024,
            paymaker_url: None,
            lookup_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ShareSubmission {
    coinbase_commit: String,
    header_and_proof: String,
}

/// What happened to an accepted share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareOutcome {
    /// The share was redeemed as a block
    pub block: bool,
    pub status: StatusCode,
    pub warnings: Vec<String>,
    pub height: u32,
    /// Parent block hashes of the share's announcements, display order
    pub ann_parent_hashes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResult {
    pub pay_to: String,
    pub ok: bool,
    pub block: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub result: Option<SubmitResult>,
    pub error: Vec<String>,
    pub warn: Vec<String>,
}

/// Share event reported to the payout service
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub height: u32,
    pub pay_to: String,
    pub block: bool,
    pub ann_parent_hashes: Vec<String>,
}

pub struct BlkHandler {
    client: PoolClient,
    rpc: Arc<dyn ChainRpc>,
    content: ContentStore,
    opts: BlkHandlerOptions,
    http: reqwest::Client,
}

impl std::fmt::Debug for BlkHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlkHandler").finish_non_exhaustive()
    }
}

impl BlkHandler {
    pub fn new(
        client: PoolClient,
        rpc: Arc<dyn ChainRpc>,
        content: ContentStore,
        opts: BlkHandlerOptions,
    ) -> Result<Self> {
        if opts.hash_mod == 0 || opts.hash_num >= opts.hash_mod {
            return Err(Error::config(format!(
                "hash_num {} must be below hash_mod {}",
                opts.hash_num, opts.hash_mod
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            rpc,
            content,
            opts,
            http,
        })
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.opts.lookup_timeout, fut)
            .await
            .map_err(|_| Error::timeout(what.to_string()))
    }

    /// Validate one submission and redeem it
    pub async fn handle_share(&self, body: &[u8], pay_to: &str) -> Result<ShareOutcome> {
        let submission: ShareSubmission = serde_json::from_slice(body)
            .map_err(|e| Error::format(format!("malformed share submission: {}", e)))?;
        let commit_bytes = hex::decode(&submission.coinbase_commit)
            .map_err(|e| Error::format(format!("coinbase_commit is not hex: {}", e)))?;
        let hap_bytes = hex::decode(&submission.header_and_proof)
            .map_err(|e| Error::format(format!("header_and_proof is not hex: {}", e)))?;
        let commit = CoinbaseCommit::decode(&commit_bytes)?;
        let hap = HeaderAndProof::decode(&hap_bytes)?;
        let pcp = hap.packetcrypt_proof()?;

        let index = content_proof_index(&share_id(&hap.header, &hap.proof));
        if index % self.opts.hash_mod != self.opts.hash_num {
            return Err(Error::policy(format!(
                "share belongs to handler {} of {}, this is {}",
                index % self.opts.hash_mod,
                self.opts.hash_mod,
                self.opts.hash_num
            )));
        }

        let work = self
            .client
            .current_work()
            .ok_or_else(|| Error::not_ready("no work from master yet"))?;
        if hap.header.prev_hash() != work.last_hash() {
            return Err(Error::policy(format!(
                "share builds on {}, current work builds on {}",
                display_hash(&hap.header.prev_hash()),
                display_hash(&work.last_hash())
            )));
        }
        let header = work.header().with_mined_fields(&hap.header);

        let mut signatures = Vec::new();
        let mut content_proofs = Vec::new();
        let mut ann_parent_hashes = Vec::with_capacity(pcp.announcements.len());
        let max_parent = work.height().checked_sub(3);
        for (i, ann) in pcp.announcements.iter().enumerate() {
            let parent = ann.parent_block_height();
            if max_parent.map_or(true, |max| parent > max) {
                return Err(Error::policy(format!(
                    "announcement {} parent height {} is too recent for work height {}",
                    i,
                    parent,
                    work.height()
                )));
            }
            if ann.is_signed() {
                let key = derive_signing_key(&self.opts.private_seed, parent + 1);
                if key.verifying_key().to_bytes() != *ann.signing_key() {
                    return Err(Error::policy(format!(
                        "announcement {} signing key is not the pool key for height {}",
                        i,
                        parent + 1
                    )));
                }
                signatures.extend_from_slice(&sign_announcement(&key, ann.as_bytes()));
            }
            let parent_work = self
                .bounded("parent work lookup", self.client.get_work_by_num(parent + 1))
                .await?;
            ann_parent_hashes.push(display_hash(&parent_work.last_hash()));

            if ann.inline_content().is_none() {
                let content = self
                    .content
                    .load(ann.content_hash(), ann.content_length())
                    .await?;
                content_proofs.extend_from_slice(&merkle::build_proof(&content, index));
            }
        }
        debug!(parents = ?ann_parent_hashes, "announcement parents resolved");

        let template = self
            .bounded("block template lookup", self.client.get_template_by_num(work.height()))
            .await?;

        let mut payload = header.as_bytes().to_vec();
        write_entity(&mut payload, entity::PCP, &hap.proof)?;
        if !signatures.is_empty() {
            write_entity(&mut payload, entity::SIGNATURES, &signatures)?;
        }
        if !content_proofs.is_empty() {
            write_entity(&mut payload, entity::CONTENT_PROOFS, &content_proofs)?;
        }
        write_entity(&mut payload, entity::TERMINATOR, &[])?;
        let coinbase = patch_coinbase(&template.coinbase, &commit)?;

        let outcome = self
            .redeem(&work, &template, payload, coinbase, ann_parent_hashes)
            .await?;
        self.report(&outcome, pay_to);
        Ok(outcome)
    }

    async fn redeem(
        &self,
        work: &Work,
        template: &BlockTemplate,
        payload: Vec<u8>,
        coinbase: Vec<u8>,
        ann_parent_hashes: Vec<String>,
    ) -> Result<ShareOutcome> {
        let request = CheckShareRequest {
            height: work.height(),
            share_target: work.share_target(),
            block_hex: hex::encode(&payload),
            coinbase_hex: hex::encode(&coinbase),
            merkle_branch: template.merkle_branch.iter().map(hex::encode).collect(),
        };
        let mut outcome = ShareOutcome {
            block: false,
            status: StatusCode::OK,
            warnings: Vec::new(),
            height: work.height(),
            ann_parent_hashes,
        };
        match self.rpc.check_pc_share(&request).await? {
            ShareCheck::Ok => return Ok(outcome),
            ShareCheck::ResubmitAsBlock => {}
            ShareCheck::Other(answer) => {
                return Err(Error::upstream(format!("checkpcshare answered {}", answer)));
            }
        }

        let mut block = payload;
        write_varint(&mut block, 1 + template.transactions.len() as u64)?;
        block.extend_from_slice(&coinbase);
        for tx in &template.transactions {
            block.extend_from_slice(tx);
        }
        outcome.block = true;
        match self.rpc.submit_block(&hex::encode(&block)).await {
            Ok(()) => {
                info!(height = work.height(), "block found and submitted");
            }
            Err(Error::Conflict { message }) => {
                warn!(height = work.height(), "block already submitted: {}", message);
                outcome.status = StatusCode::CONFLICT;
                outcome.warnings.push(format!("block already submitted: {}", message));
            }
            Err(e) => return Err(e),
        }
        Ok(outcome)
    }

    /// Post a share event to the payout service in the background
    fn report(&self, outcome: &ShareOutcome, pay_to: &str) {
        let Some(base) = &self.opts.paymaker_url else {
            return;
        };
        let url = match base.join("events") {
            Ok(url) => url,
            Err(e) => {
                warn!("bad paymaker URL {}: {}", base, e);
                return;
            }
        };
        let event = ShareEvent {
            kind: "share".to_string(),
            height: outcome.height,
            pay_to: pay_to.to_string(),
            block: outcome.block,
            ann_parent_hashes: outcome.ann_parent_hashes.clone(),
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            let result = http
                .post(url)
                .json(&event)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                warn!("reporting share event failed: {}", e);
            }
        });
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/submit", post(submit_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

fn failure(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(SubmitResponse {
            result: None,
            error: vec![message],
            warn: vec![],
        }),
    )
        .into_response()
}

async fn submit_handler(
    State(handler): State<Arc<BlkHandler>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let pay_to = headers
        .get(PAYTO_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = match to_bytes(body, handler.opts.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("request body rejected: {}", e),
            );
        }
    };

    match handler.handle_share(&body, &pay_to).await {
        Ok(outcome) => (
            outcome.status,
            Json(SubmitResponse {
                result: Some(SubmitResult {
                    pay_to,
                    ok: true,
                    block: outcome.block,
                }),
                error: vec![],
                warn: outcome.warnings,
            }),
        )
            .into_response(),
        Err(e) => {
            match e.status_code() {
                StatusCode::BAD_REQUEST => debug!("share rejected: {}", e),
                _ => warn!("share failed [{}]: {}", e.category(), e),
            }
            failure(e.status_code(), e.to_string())
        }
    }
}
