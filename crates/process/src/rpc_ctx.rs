use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::keccak256;
use alloy::providers::{Provider, RootProvider};
use async_trait::async_trait;
use serde_json::{Value, json};

use kyomei_common::error::{KyomeiError, Result};
use kyomei_common::types::RpcCacheRow;
use kyomei_store::RpcCacheStore;

const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// JSON-level EVM RPC transport; the cache sits in front of this.
#[async_trait]
pub trait EvmRpc: Send + Sync {
    async fn call(&self, method: &str, params: &Value) -> Result<Value>;
}

/// Alloy-backed transport.
pub struct AlloyRpc {
    provider: RootProvider,
}

impl AlloyRpc {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = url
            .parse()
            .map_err(|e| KyomeiError::Config(format!("bad rpc url {url}: {e}")))?;
        Ok(Self {
            provider: RootProvider::new_http(parsed),
        })
    }
}

#[async_trait]
impl EvmRpc for AlloyRpc {
    async fn call(&self, method: &str, params: &Value) -> Result<Value> {
        let request = self
            .provider
            .raw_request::<Value, Value>(method.to_string().into(), params.clone());

        tokio::time::timeout(RPC_CALL_TIMEOUT, request)
            .await
            .map_err(|_| KyomeiError::Rpc(format!("{method} timed out")))?
            .map_err(|e| KyomeiError::Rpc(format!("{method}: {e}")))
    }
}

/// The request hash half of the cache key: `keccak256(method ∥ canonical
/// params JSON)`. serde_json objects serialize with sorted keys, so two
/// param objects that differ only in construction order hash identically.
pub fn request_hash(method: &str, params: &Value) -> String {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let digest = keccak256(format!("{method}{canonical}").as_bytes());
    format!("{digest:#x}")
}

/// Deterministic RPC client handed to handlers.
///
/// Every call is pinned to the block of the event being processed and keyed
/// by `(chain, block, request hash)` in the cache table, so replaying a
/// range reproduces byte-identical responses without touching the upstream
/// client.
#[derive(Clone)]
pub struct CachedRpc {
    chain_id: u64,
    client: Arc<dyn EvmRpc>,
    cache: RpcCacheStore,
    pinned_block: u64,
}

impl CachedRpc {
    pub fn new(chain_id: u64, client: Arc<dyn EvmRpc>, cache: RpcCacheStore) -> Self {
        Self {
            chain_id,
            client,
            cache,
            pinned_block: 0,
        }
    }

    /// The same client re-pinned to another block; the processor does this
    /// per event.
    pub fn pinned(&self, block_number: u64) -> Self {
        Self {
            pinned_block: block_number,
            ..self.clone()
        }
    }

    pub fn pinned_block(&self) -> u64 {
        self.pinned_block
    }

    fn block_tag(&self) -> String {
        format!("0x{:x}", self.pinned_block)
    }

    /// `eth_call` against `to` at the pinned block. Calldata in, returndata
    /// out, both 0x-hex.
    pub async fn read_contract(&self, to: &str, calldata: &str) -> Result<String> {
        let params = json!([{ "to": to, "data": calldata }, self.block_tag()]);
        let response = self.cached("eth_call", params).await?;
        as_hex_string(response)
    }

    pub async fn get_balance(&self, address: &str) -> Result<String> {
        let params = json!([address, self.block_tag()]);
        let response = self.cached("eth_getBalance", params).await?;
        as_hex_string(response)
    }

    /// The pinned block's header (without transaction bodies).
    pub async fn get_block(&self) -> Result<Value> {
        let params = json!([self.block_tag(), false]);
        self.cached("eth_getBlockByNumber", params).await
    }

    pub async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Value> {
        let params = json!([tx_hash]);
        self.cached("eth_getTransactionReceipt", params).await
    }

    async fn cached(&self, method: &str, params: Value) -> Result<Value> {
        let hash = request_hash(method, &params);

        if let Some(hit) = self.cache.get(self.chain_id, self.pinned_block, &hash).await? {
            tracing::trace!(method, block = self.pinned_block, "RPC cache hit");
            return Ok(hit);
        }

        let response = self.client.call(method, &params).await?;

        self.cache
            .put(&RpcCacheRow {
                chain_id: self.chain_id,
                block_number: self.pinned_block,
                request_hash: hash,
                method: method.to_string(),
                params,
                response: response.clone(),
            })
            .await?;

        Ok(response)
    }
}

fn as_hex_string(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(KyomeiError::Rpc(format!("expected hex string, got {other}"))),
    }
}
