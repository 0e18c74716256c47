//! Chain daemon RPC
//!
//! The pool only speaks four calls to the chain daemon: fetch a raw block
//! template, long-poll for a new tip, check a PacketCrypt share and submit a
//! block. [`ChainRpc`] is the seam the master and block handler depend on;
//! [`JsonRpcClient`] implements it over JSON-RPC 1.0 on HTTP.

use crate::types::{BlockHeader, BlockTemplate};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Template as returned by `getrawblocktemplate`, all binary fields hex encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlockTemplate {
    pub height: u32,
    pub header: String,
    pub coinbase_no_witness: String,
    #[serde(default)]
    pub merklebranch: Vec<String>,
    #[serde(default)]
    pub transactions: Vec<String>,
}

impl RawBlockTemplate {
    /// Decode the hex fields; a malformed template is an upstream error
    pub fn into_template(self) -> Result<BlockTemplate> {
        let header = hex::decode(&self.header)
            .map_err(|e| Error::upstream(format!("template header is not hex: {}", e)))
            .and_then(|h| {
                BlockHeader::from_slice(&h).map_err(|e| Error::upstream(e.to_string()))
            })?;
        let coinbase = hex::decode(&self.coinbase_no_witness)
            .map_err(|e| Error::upstream(format!("template coinbase is not hex: {}", e)))?;
        let merkle_branch = self
            .merklebranch
            .iter()
            .map(|h| {
                let bytes = hex::decode(h).map_err(|e| {
                    Error::upstream(format!("merkle branch entry is not hex: {}", e))
                })?;
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    Error::upstream(format!("merkle branch entry is {} bytes", bytes.len()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let transactions = self
            .transactions
            .iter()
            .map(|tx| {
                hex::decode(tx).map_err(|e| {
                    Error::upstream(format!("template transaction is not hex: {}", e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BlockTemplate {
            height: self.height,
            header,
            coinbase,
            merkle_branch,
            transactions,
        })
    }
}

/// Tip reported by a `getblocktemplate` long-poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipInfo {
    /// Hash of the current best block, internal byte order
    pub previous_block_hash: [u8; 32],
    pub longpoll_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GbtResponse {
    previousblockhash: String,
    #[serde(default)]
    longpollid: Option<String>,
}

impl TryFrom<GbtResponse> for TipInfo {
    type Error = Error;

    fn try_from(resp: GbtResponse) -> Result<Self> {
        let bytes = hex::decode(&resp.previousblockhash)
            .map_err(|e| Error::upstream(format!("previousblockhash is not hex: {}", e)))?;
        let mut hash = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
            Error::upstream(format!("previousblockhash is {} bytes", bytes.len()))
        })?;
        // Daemons report hashes in display order
        hash.reverse();
        Ok(TipInfo {
            previous_block_hash: hash,
            longpoll_id: resp.longpollid,
        })
    }
}

/// Arguments to `checkpcshare`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckShareRequest {
    pub height: u32,
    pub share_target: u32,
    pub block_hex: String,
    pub coinbase_hex: String,
    pub merkle_branch: Vec<String>,
}

/// Answer from `checkpcshare`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareCheck {
    /// Valid share that does not meet block difficulty
    Ok,
    /// Share meets block difficulty; submit it as a block
    ResubmitAsBlock,
    /// Anything else the daemon said
    Other(String),
}

impl From<String> for ShareCheck {
    fn from(s: String) -> Self {
        match s.as_str() {
            "OK" => ShareCheck::Ok,
            "RESUBMIT_AS_BLOCK" => ShareCheck::ResubmitAsBlock,
            _ => ShareCheck::Other(s),
        }
    }
}

/// Operations the pool needs from its chain daemon
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_raw_block_template(&self) -> Result<RawBlockTemplate>;

    /// Block until the tip may have changed; `None` asks for the current tip
    async fn wait_for_tip(&self, longpoll_id: Option<String>) -> Result<TipInfo>;

    async fn check_pc_share(&self, request: &CheckShareRequest) -> Result<ShareCheck>;

    /// Submit a full block. Duplicates map to [`Error::Conflict`], other refusals
    /// to [`Error::Rejected`].
    async fn submit_block(&self, block_hex: &str) -> Result<()>;
}

/// Classify a `submitblock` refusal
pub fn submit_failure(reason: &str) -> Error {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("already have block") || lower.contains("duplicate") {
        Error::conflict(reason.to_string())
    } else {
        Error::rejected(reason.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

/// JSON-RPC 1.0 client for the chain daemon
pub struct JsonRpcClient {
    client: Client,
    url: Url,
    auth: Option<(String, String)>,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: Url, user: Option<String>, password: Option<String>) -> Result<Self> {
        Self::with_timeout(url, user, password, Duration::from_secs(120))
    }

    /// The timeout must outlast the daemon's long-poll interval
    pub fn with_timeout(
        url: Url,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(format!("pool-coordinator/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        let auth = user.map(|u| (u, password.unwrap_or_default()));
        Ok(Self {
            client,
            url,
            auth,
            next_id: AtomicU64::new(1),
        })
    }

    /// Call `method`; an RPC-level error becomes [`Error::Upstream`]
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut request = self.client.post(self.url.clone()).json(&body);
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        // Daemons report RPC errors with a 500 and a JSON body, so parse first
        let parsed: RpcResponse = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(Error::upstream(format!(
                    "{} returned HTTP {}: {}",
                    method,
                    status,
                    text.trim()
                )));
            }
            Err(e) => return Err(Error::upstream(format!("{} response: {}", method, e))),
        };
        if let Some(err) = parsed.error {
            return Err(Error::upstream(format!(
                "{} failed ({}): {}",
                method, err.code, err.message
            )));
        }
        debug!(method, id, "rpc ok");
        Ok(parsed.result)
    }
}

#[async_trait]
impl ChainRpc for JsonRpcClient {
    #[instrument(skip(self))]
    async fn get_raw_block_template(&self) -> Result<RawBlockTemplate> {
        let result = self.call("getrawblocktemplate", json!([])).await?;
        serde_json::from_value(result)
            .map_err(|e| Error::upstream(format!("malformed getrawblocktemplate result: {}", e)))
    }

    #[instrument(skip(self))]
    async fn wait_for_tip(&self, longpoll_id: Option<String>) -> Result<TipInfo> {
        let params = match longpoll_id {
            Some(id) => json!([{ "longpollid": id, "rules": ["segwit"] }]),
            None => json!([{ "rules": ["segwit"] }]),
        };
        let result = self.call("getblocktemplate", params).await?;
        let resp: GbtResponse = serde_json::from_value(result)
            .map_err(|e| Error::upstream(format!("malformed getblocktemplate result: {}", e)))?;
        resp.try_into()
    }

    #[instrument(skip(self, request), fields(height = request.height))]
    async fn check_pc_share(&self, request: &CheckShareRequest) -> Result<ShareCheck> {
        let params = json!([
            request.height,
            request.share_target,
            request.block_hex,
            request.coinbase_hex,
            request.merkle_branch,
        ]);
        match self.call("checkpcshare", params).await? {
            Value::String(s) => Ok(s.into()),
            other => Err(Error::upstream(format!(
                "checkpcshare returned non-string {}",
                other
            ))),
        }
    }

    #[instrument(skip(self, block_hex), fields(len = block_hex.len() / 2))]
    async fn submit_block(&self, block_hex: &str) -> Result<()> {
        match self.call("submitblock", json!([block_hex])).await {
            Ok(Value::Null) => Ok(()),
            Ok(Value::String(reason)) => Err(submit_failure(&reason)),
            Ok(other) => Err(submit_failure(&other.to_string())),
            Err(Error::Upstream { message }) => Err(submit_failure(&message)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Coinbase carrying the commitment placeholder between two filler runs
    pub(crate) fn coinbase_with_placeholder() -> Vec<u8> {
        let mut coinbase = vec![0x01, 0x00, 0x00, 0x00, 0x01];
        coinbase.extend_from_slice(&[0x6a, 0x30, 0x09, 0xf9, 0x11, 0x02]);
        coinbase.extend_from_slice(&[0xfc; 44]);
        coinbase.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        coinbase
    }

    /// Template at `height` building on `prev` (internal byte order)
    pub(crate) fn raw_template(height: u32, prev: [u8; 32]) -> RawBlockTemplate {
        let mut header = [0u8; 80];
        header[0] = 0x20;
        header[4..36].copy_from_slice(&prev);
        header[68..72].copy_from_slice(&1_700_000_000u32.to_le_bytes());
        header[72..76].copy_from_slice(&0x207fffffu32.to_le_bytes());
        RawBlockTemplate {
            height,
            header: hex::encode(header),
            coinbase_no_witness: hex::encode(coinbase_with_placeholder()),
            merklebranch: vec![hex::encode([0x11u8; 32])],
            transactions: vec![hex::encode([0x22u8; 60])],
        }
    }

    /// Scriptable in-memory chain daemon
    pub(crate) struct MockRpc {
        pub template: Mutex<RawBlockTemplate>,
        pub tip: Mutex<[u8; 32]>,
        pub tip_changed: Notify,
        pub tip_version: AtomicUsize,
        pub check_answer: Mutex<String>,
        pub submit_error: Mutex<Option<String>>,
        pub checked: Mutex<Vec<CheckShareRequest>>,
        pub submitted: Mutex<Vec<String>>,
        pub template_calls: AtomicUsize,
        pub fail_templates: AtomicUsize,
    }

    impl MockRpc {
        pub fn new(template: RawBlockTemplate) -> Self {
            let header = hex::decode(&template.header).unwrap();
            let mut tip = [0u8; 32];
            tip.copy_from_slice(&header[4..36]);
            Self {
                template: Mutex::new(template),
                tip: Mutex::new(tip),
                tip_changed: Notify::new(),
                tip_version: AtomicUsize::new(0),
                check_answer: Mutex::new("OK".to_string()),
                submit_error: Mutex::new(None),
                checked: Mutex::new(Vec::new()),
                submitted: Mutex::new(Vec::new()),
                template_calls: AtomicUsize::new(0),
                fail_templates: AtomicUsize::new(0),
            }
        }

        /// Move the chain to a new template and wake tip waiters
        pub fn advance(&self, template: RawBlockTemplate) {
            let header = hex::decode(&template.header).unwrap();
            self.tip.lock().copy_from_slice(&header[4..36]);
            *self.template.lock() = template;
            self.tip_version.fetch_add(1, Ordering::SeqCst);
            self.tip_changed.notify_waiters();
        }
    }

    #[async_trait]
    impl ChainRpc for MockRpc {
        async fn get_raw_block_template(&self) -> Result<RawBlockTemplate> {
            self.template_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.fail_templates.load(Ordering::SeqCst);
            if failing > 0 {
                self.fail_templates.store(failing - 1, Ordering::SeqCst);
                return Err(Error::upstream("template unavailable"));
            }
            Ok(self.template.lock().clone())
        }

        async fn wait_for_tip(&self, longpoll_id: Option<String>) -> Result<TipInfo> {
            loop {
                let notified = self.tip_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let version = self.tip_version.load(Ordering::SeqCst).to_string();
                if longpoll_id.as_deref() != Some(version.as_str()) {
                    return Ok(TipInfo {
                        previous_block_hash: *self.tip.lock(),
                        longpoll_id: Some(version),
                    });
                }
                notified.await;
            }
        }

        async fn check_pc_share(&self, request: &CheckShareRequest) -> Result<ShareCheck> {
            self.checked.lock().push(request.clone());
            Ok(self.check_answer.lock().clone().into())
        }

        async fn submit_block(&self, block_hex: &str) -> Result<()> {
            self.submitted.lock().push(block_hex.to_string());
            match self.submit_error.lock().clone() {
                Some(reason) => Err(submit_failure(&reason)),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HEADER_SIZE;
    use assert_matches::assert_matches;
    use mockito::{Matcher, Server};

    fn client(server: &Server) -> JsonRpcClient {
        JsonRpcClient::new(
            Url::parse(&server.url()).unwrap(),
            Some("user".to_string()),
            Some("pass".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_raw_template_conversion() {
        let raw = RawBlockTemplate {
            height: 10,
            header: hex::encode([3u8; HEADER_SIZE]),
            coinbase_no_witness: "0102".to_string(),
            merklebranch: vec![hex::encode([4u8; 32])],
            transactions: vec!["aabb".to_string()],
        };
        let bt = raw.into_template().unwrap();
        assert_eq!(bt.height, 10);
        assert_eq!(bt.coinbase, vec![1, 2]);
        assert_eq!(bt.merkle_branch, vec![[4u8; 32]]);
        assert_eq!(bt.transactions, vec![vec![0xaa, 0xbb]]);

        let short = RawBlockTemplate {
            height: 10,
            header: "00".to_string(),
            coinbase_no_witness: String::new(),
            merklebranch: vec![],
            transactions: vec![],
        };
        assert_matches!(short.into_template(), Err(Error::Upstream { .. }));
    }

    #[test]
    fn test_submit_failure_classification() {
        assert_matches!(submit_failure("already have block"), Error::Conflict { .. });
        assert_matches!(submit_failure("duplicate"), Error::Conflict { .. });
        assert_matches!(submit_failure("bad-txnmrklroot"), Error::Rejected { .. });
    }

    #[tokio::test]
    async fn test_wait_for_tip_reverses_hash() {
        let mut server = Server::new_async().await;
        let mut display = [0u8; 32];
        display[0] = 0xab;
        let mock = server
            .mock("POST", "/")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::PartialJson(json!({
                "method": "getblocktemplate",
                "params": [{ "longpollid": "lp1" }]
            })))
            .with_status(200)
            .with_body(
                json!({
                    "result": { "previousblockhash": hex::encode(display), "longpollid": "lp2" },
                    "error": null,
                    "id": 1
                })
                .to_string(),
            )
            .create_async()
            .await;

        let tip = client(&server).wait_for_tip(Some("lp1".to_string())).await.unwrap();
        assert_eq!(tip.previous_block_hash[31], 0xab);
        assert_eq!(tip.longpoll_id.as_deref(), Some("lp2"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_pc_share_positional_params() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({
                "method": "checkpcshare",
                "params": [12, 7, "aa", "bb", ["cc"]]
            })))
            .with_body(json!({ "result": "RESUBMIT_AS_BLOCK", "error": null, "id": 1 }).to_string())
            .create_async()
            .await;

        let request = CheckShareRequest {
            height: 12,
            share_target: 7,
            block_hex: "aa".to_string(),
            coinbase_hex: "bb".to_string(),
            merkle_branch: vec!["cc".to_string()],
        };
        let answer = client(&server).check_pc_share(&request).await.unwrap();
        assert_eq!(answer, ShareCheck::ResubmitAsBlock);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_block_results() {
        let mut server = Server::new_async().await;
        let _ok = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "params": ["01"] })))
            .with_body(json!({ "result": null, "error": null, "id": 1 }).to_string())
            .create_async()
            .await;
        let _dup = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "params": ["02"] })))
            .with_body(json!({ "result": "duplicate", "error": null, "id": 1 }).to_string())
            .create_async()
            .await;
        let _err = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "params": ["03"] })))
            .with_status(500)
            .with_body(
                json!({ "result": null, "error": { "code": -25, "message": "bad-prevblk" }, "id": 1 })
                    .to_string(),
            )
            .create_async()
            .await;

        let rpc = client(&server);
        assert!(rpc.submit_block("01").await.is_ok());
        assert_matches!(rpc.submit_block("02").await, Err(Error::Conflict { .. }));
        assert_matches!(rpc.submit_block("03").await, Err(Error::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_http_error_without_json_is_upstream() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;
        let result = client(&server).get_raw_block_template().await;
        assert_matches!(result, Err(Error::Upstream { .. }));
    }

    #[tokio::test]
    async fn test_garbled_template_result_is_upstream() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_body(r#"{"result":{"height":"soon"},"error":null,"id":1}"#)
            .create_async()
            .await;
        let result = client(&server).get_raw_block_template().await;
        assert_matches!(result, Err(Error::Upstream { .. }));
        assert!(result.unwrap_err().is_retryable());
    }
}
