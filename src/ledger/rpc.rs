//! JSON-RPC wallet client for the node's HTTP endpoint.
//!
//! One client per endpoint: either the node root (`http://host:port/`) or a
//! loaded wallet (`http://host:port/wallet/<name>`). Requests use HTTP basic
//! auth. The node answers RPC-level failures with a JSON `error` object,
//! sometimes alongside a non-2xx status, and both shapes are mapped into
//! [`TransportError`].

use super::{Amount, Category, DetailEntry, LedgerClient, Transaction, TransportError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct RpcEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Wallet path segment; `None` addresses the node root.
    pub wallet: Option<String>,
    pub timeout: Duration,
}

impl RpcEndpoint {
    pub fn url(&self) -> String {
        match &self.wallet {
            Some(wallet) => format!("http://{}:{}/wallet/{}", self.host, self.port, wallet),
            None => format!("http://{}:{}/", self.host, self.port),
        }
    }
}

/// Subset of `getblockchaininfo` logged at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(default)]
    pub headers: u64,
    #[serde(default, rename = "bestblockhash")]
    pub best_block_hash: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Transaction as the node serialises it. `category` is present on
/// `listtransactions` rows and usually absent from `gettransaction`.
/// Conflicted transactions report negative confirmations.
#[derive(Debug, Deserialize)]
struct WireTransaction {
    txid: String,
    #[serde(default)]
    category: Option<Category>,
    amount: Amount,
    #[serde(default)]
    confirmations: i64,
    #[serde(default)]
    details: Vec<WireDetail>,
}

#[derive(Debug, Deserialize)]
struct WireDetail {
    category: Category,
    amount: Amount,
    #[serde(default)]
    address: Option<String>,
}

impl From<WireTransaction> for Transaction {
    fn from(wire: WireTransaction) -> Self {
        Transaction {
            txid: wire.txid,
            category: wire.category.unwrap_or(Category::Other),
            amount: wire.amount,
            confirmations: u32::try_from(wire.confirmations.max(0)).unwrap_or(u32::MAX),
            details: wire
                .details
                .into_iter()
                .map(|d| DetailEntry {
                    category: d.category,
                    amount: d.amount,
                    address: d.address,
                })
                .collect(),
        }
    }
}

/// Authenticated JSON-RPC client for one node endpoint.
pub struct WalletRpcClient {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl WalletRpcClient {
    pub fn new(endpoint: &RpcEndpoint) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .build()?;
        Ok(Self {
            client,
            url: endpoint.url(),
            user: endpoint.user.clone(),
            password: endpoint.password.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue one RPC call and decode its `result`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, TransportError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": method,
            "params": params,
        });

        debug!(url = %self.url, method = method, "rpc call");

        let resp = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&payload)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;

        decode_response(method, status, &body)
    }

    pub async fn blockchain_info(&self) -> Result<BlockchainInfo, TransportError> {
        self.call("getblockchaininfo", json!([])).await
    }
}

fn decode_response<T: DeserializeOwned>(
    method: &str,
    status: u16,
    body: &str,
) -> Result<T, TransportError> {
    let malformed = |reason: String| TransportError::Malformed {
        method: method.to_string(),
        reason,
    };

    match serde_json::from_str::<RpcResponse>(body) {
        Ok(RpcResponse {
            error: Some(err), ..
        }) => Err(TransportError::Rpc {
            method: method.to_string(),
            status,
            code: err.code,
            message: err.message,
        }),
        _ if status >= 300 => Err(TransportError::Status {
            method: method.to_string(),
            status,
            body: body.to_string(),
        }),
        Ok(RpcResponse {
            result: Some(result),
            ..
        }) => serde_json::from_value(result).map_err(|e| malformed(e.to_string())),
        Ok(RpcResponse { result: None, .. }) => Err(malformed("missing result".to_string())),
        Err(e) => Err(malformed(e.to_string())),
    }
}

#[async_trait]
impl LedgerClient for WalletRpcClient {
    async fn list_recent(
        &self,
        count: usize,
        skip: usize,
        include_watch_only: bool,
    ) -> Result<Vec<Transaction>, TransportError> {
        let rows: Vec<WireTransaction> = self
            .call(
                "listtransactions",
                json!(["*", count, skip, include_watch_only]),
            )
            .await?;
        Ok(rows.into_iter().map(Transaction::from).collect())
    }

    async fn get_detail(&self, txid: &str) -> Result<Transaction, TransportError> {
        let wire: WireTransaction = self.call("gettransaction", json!([txid])).await?;
        Ok(wire.into())
    }

    async fn send(&self, destination: &str, amount: Amount) -> Result<String, TransportError> {
        // The node accepts amounts as decimal strings, which keeps them exact.
        self.call("sendtoaddress", json!([destination, amount.to_string()]))
            .await
    }
}
