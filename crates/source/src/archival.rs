use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use kyomei_common::error::{KyomeiError, Result};
use kyomei_common::types::normalize_hex;

use crate::{BlockPage, BlockSource, BlockSubscription, BlockWithLogs, LogFilter, SourceLog};

/// Archival-query source: batched range queries against an archive service
/// that only serves canonical-chain data, so `provides_validated_data()` is
/// true and the syncer never re-checks a trailing window.
///
/// Protocol: `GET /height` reports the served tip, `POST /query` returns
/// every block in an inclusive range that carries matching logs.
pub struct ArchivalSource {
    chain_id: u64,
    base_url: String,
    client: reqwest::Client,
    poll_interval: Duration,
    closed: AtomicBool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HeightWire {
    pub height: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryWire<'a> {
    from_block: u64,
    to_block: u64,
    addresses: &'a [String],
}

#[derive(Debug, Deserialize)]
struct QueryResponseWire {
    blocks: Vec<BlockWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BlockWire {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub logs: Vec<LogWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LogWire {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub transaction_hash: String,
    pub transaction_index: u32,
    pub log_index: u32,
}

impl BlockWire {
    pub(crate) fn into_block(self) -> BlockWithLogs {
        let mut logs: Vec<SourceLog> = self
            .logs
            .into_iter()
            .filter(|l| !l.topics.is_empty())
            .map(|l| SourceLog {
                address: normalize_hex(&l.address),
                topics: l.topics.iter().map(|t| normalize_hex(t)).collect(),
                data: normalize_hex(&l.data),
                tx_hash: normalize_hex(&l.transaction_hash),
                tx_index: l.transaction_index,
                log_index: l.log_index,
            })
            .collect();
        logs.sort_by_key(|l| (l.tx_index, l.log_index));

        BlockWithLogs {
            number: self.number,
            hash: normalize_hex(&self.hash),
            parent_hash: normalize_hex(&self.parent_hash),
            timestamp: chrono::DateTime::from_timestamp(self.timestamp, 0)
                .unwrap_or_else(chrono::Utc::now),
            logs,
        }
    }
}

pub(crate) fn build_client(bearer_token: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(token) = bearer_token {
        let value = format!("Bearer {token}")
            .parse()
            .map_err(|_| KyomeiError::Config("bearer token is not a valid header".into()))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| KyomeiError::Config(format!("cannot build http client: {e}")))
}

fn transient(err: impl std::fmt::Display) -> KyomeiError {
    KyomeiError::SourceTransient(err.to_string())
}

impl ArchivalSource {
    pub fn new(
        chain_id: u64,
        url: &str,
        bearer_token: Option<&str>,
        poll_interval_ms: u64,
    ) -> Result<Self> {
        Ok(Self {
            chain_id,
            base_url: url.trim_end_matches('/').to_string(),
            client: build_client(bearer_token, Duration::from_secs(30))?,
            poll_interval: Duration::from_millis(poll_interval_ms),
            closed: AtomicBool::new(false),
        })
    }

    async fn height(&self) -> Result<u64> {
        let response = self
            .client
            .get(format!("{}/height", self.base_url))
            .send()
            .await
            .map_err(transient)?
            .error_for_status()
            .map_err(transient)?;

        let wire: HeightWire = response.json().await.map_err(transient)?;
        Ok(wire.height)
    }

    async fn query(&self, from: u64, to: u64, filter: &LogFilter) -> Result<BlockPage> {
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&QueryWire {
                from_block: from,
                to_block: to,
                addresses: &filter.addresses,
            })
            .send()
            .await
            .map_err(transient)?
            .error_for_status()
            .map_err(transient)?;

        let wire: QueryResponseWire = response.json().await.map_err(transient)?;
        let page = BlockPage {
            from,
            to,
            blocks: wire.blocks.into_iter().map(BlockWire::into_block).collect(),
        };
        page.validate()?;
        Ok(page)
    }
}

#[async_trait]
impl BlockSource for ArchivalSource {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn provides_validated_data(&self) -> bool {
        true
    }

    async fn latest_block_number(&self) -> Result<u64> {
        self.height().await
    }

    /// The archive only ever serves finalized data.
    async fn finalized_block_number(&self) -> Result<u64> {
        self.height().await
    }

    async fn get_blocks(&self, from: u64, to: u64, filter: &LogFilter) -> Result<BlockPage> {
        if from > to {
            return Ok(BlockPage {
                from,
                to,
                blocks: Vec::new(),
            });
        }
        self.query(from, to, filter).await
    }

    /// Long-poll the archive height and fetch newly served blocks.
    async fn subscribe_blocks(&self) -> Result<BlockSubscription> {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let poll_interval = self.poll_interval;
        let chain_id = self.chain_id;
        let (tx, rx) = mpsc::channel(64);

        let start = self.height().await?;
        let task = tokio::spawn(async move {
            let mut next = start + 1;
            loop {
                tokio::time::sleep(poll_interval).await;

                let height = match fetch_height(&client, &base_url).await {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::debug!(chain_id, error = %e, "Archive height poll failed");
                        continue;
                    }
                };

                while next <= height {
                    match fetch_range(&client, &base_url, next, next).await {
                        Ok(blocks) => {
                            // A block with no matching logs still advances.
                            for block in blocks {
                                if tx.send(block).await.is_err() {
                                    return;
                                }
                            }
                            next += 1;
                        }
                        Err(e) => {
                            tracing::debug!(chain_id, block = next, error = %e, "Archive fetch failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(BlockSubscription::new(rx, task))
    }

    async fn healthy(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.height().await.is_ok()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

async fn fetch_height(client: &reqwest::Client, base_url: &str) -> Result<u64> {
    let response = client
        .get(format!("{base_url}/height"))
        .send()
        .await
        .map_err(transient)?
        .error_for_status()
        .map_err(transient)?;
    let wire: HeightWire = response.json().await.map_err(transient)?;
    Ok(wire.height)
}

async fn fetch_range(
    client: &reqwest::Client,
    base_url: &str,
    from: u64,
    to: u64,
) -> Result<Vec<BlockWithLogs>> {
    let response = client
        .post(format!("{base_url}/query"))
        .json(&serde_json::json!({ "fromBlock": from, "toBlock": to, "addresses": [] }))
        .send()
        .await
        .map_err(transient)?
        .error_for_status()
        .map_err(transient)?;
    let wire: QueryResponseWire = response.json().await.map_err(transient)?;
    Ok(wire.blocks.into_iter().map(BlockWire::into_block).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_wire_normalizes_and_orders() {
        let wire: BlockWire = serde_json::from_str(
            r#"{
                "number": 150,
                "hash": "0xAAAA",
                "parentHash": "0xBBBB",
                "timestamp": 1700000000,
                "logs": [
                    { "address": "0xCCCC", "topics": ["0xDD"], "data": "0x",
                      "transactionHash": "0xEE", "transactionIndex": 1, "logIndex": 3 },
                    { "address": "0xCCCC", "topics": ["0xDD"], "data": "0x",
                      "transactionHash": "0xFF", "transactionIndex": 0, "logIndex": 1 },
                    { "address": "0xCCCC", "topics": [], "data": "0x",
                      "transactionHash": "0xF0", "transactionIndex": 0, "logIndex": 0 }
                ]
            }"#,
        )
        .unwrap();

        let block = wire.into_block();
        assert_eq!(block.hash, "0xaaaa");
        // The anonymous (topicless) log is dropped, the rest are ordered.
        assert_eq!(block.logs.len(), 2);
        assert_eq!(block.logs[0].tx_index, 0);
        assert_eq!(block.logs[1].tx_index, 1);
        assert_eq!(block.logs[0].address, "0xcccc");
    }
}
