//! JSON-RPC 2.0 client for an Ethereum node.

use crate::ChainError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    /// `true` when the transaction succeeded.
    pub status: bool,
    pub block_number: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptBody {
    status: Option<String>,
    block_number: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockBody {
    base_fee_per_gas: Option<String>,
}

/// Parses a hex quantity such as `0x1a`.
pub(crate) fn parse_quantity(s: &str) -> Result<u128, ChainError> {
    let raw = s
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::Decode(format!("quantity {s} lacks 0x prefix")))?;
    if raw.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(raw, 16).map_err(|e| ChainError::Decode(format!("quantity {s}: {e}")))
}

fn parse_u64(s: &str) -> Result<u64, ChainError> {
    u64::try_from(parse_quantity(s)?)
        .map_err(|_| ChainError::Decode(format!("quantity {s} overflows u64")))
}

fn hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn parse_data(s: &str) -> Result<Vec<u8>, ChainError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|e| ChainError::Decode(format!("data: {e}")))
}

pub struct EthClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl EthClient {
    /// # Errors
    ///
    /// Returns [`ChainError::Transport`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let send = async {
            let resp = self.client.post(&self.url).json(&body).send().await?;
            if !resp.status().is_success() {
                return Err(ChainError::Transport(format!(
                    "{method}: http {}",
                    resp.status()
                )));
            }
            Ok(resp.json::<RpcResponse>().await?)
        };
        let resp = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| ChainError::Timeout)??;

        if let Some(err) = resp.error {
            tracing::debug!(method, code = err.code, "rpc error: {}", err.message);
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        match resp.result {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| ChainError::Decode(format!("{method}: {e}"))),
        }
    }

    async fn required<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        self.request(method, params)
            .await?
            .ok_or_else(|| ChainError::Decode(format!("{method} returned null")))
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<u128, ChainError> {
        let s: String = self.required(method, params).await?;
        parse_quantity(&s)
    }

    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        let s: String = self.required("eth_chainId", json!([])).await?;
        parse_u64(&s)
    }

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        let s: String = self.required("eth_blockNumber", json!([])).await?;
        parse_u64(&s)
    }

    /// Pending nonce of `address`.
    pub async fn transaction_count(&self, address: &[u8; 20]) -> Result<u64, ChainError> {
        let s: String = self
            .required(
                "eth_getTransactionCount",
                json!([hex_data(address), "pending"]),
            )
            .await?;
        parse_u64(&s)
    }

    pub async fn gas_price(&self) -> Result<u128, ChainError> {
        self.quantity("eth_gasPrice", json!([])).await
    }

    pub async fn max_priority_fee(&self) -> Result<u128, ChainError> {
        self.quantity("eth_maxPriorityFeePerGas", json!([])).await
    }

    /// Base fee of the latest block; zero on pre-London chains.
    pub async fn base_fee(&self) -> Result<u128, ChainError> {
        let block: BlockBody = self
            .required("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        match block.base_fee_per_gas {
            Some(fee) => parse_quantity(&fee),
            None => Ok(0),
        }
    }

    pub async fn estimate_gas(
        &self,
        from: &[u8; 20],
        to: &[u8; 20],
        data: &[u8],
    ) -> Result<u64, ChainError> {
        let s: String = self
            .required(
                "eth_estimateGas",
                json!([{ "from": hex_data(from), "to": hex_data(to), "data": hex_data(data) }]),
            )
            .await?;
        parse_u64(&s)
    }

    /// Returns the transaction hash.
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, ChainError> {
        self.required("eth_sendRawTransaction", json!([hex_data(raw)]))
            .await
    }

    /// `None` while the transaction is pending.
    pub async fn transaction_receipt(&self, tx: &str) -> Result<Option<TxReceipt>, ChainError> {
        let Some(body) = self
            .request::<ReceiptBody>("eth_getTransactionReceipt", json!([tx]))
            .await?
        else {
            return Ok(None);
        };
        let Some(block) = body.block_number else {
            return Ok(None);
        };
        let status = match body.status.as_deref() {
            Some(s) => parse_quantity(s)? == 1,
            None => true,
        };
        Ok(Some(TxReceipt {
            status,
            block_number: parse_u64(&block)?,
        }))
    }

    /// `eth_call` against the latest block.
    pub async fn call(&self, to: &[u8; 20], data: &[u8]) -> Result<Vec<u8>, ChainError> {
        let s: String = self
            .required(
                "eth_call",
                json!([{ "to": hex_data(to), "data": hex_data(data) }, "latest"]),
            )
            .await?;
        parse_data(&s)
    }
}
