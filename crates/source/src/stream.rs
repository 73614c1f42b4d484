use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use kyomei_common::error::{KyomeiError, Result};

use crate::archival::{BlockWire, HeightWire, build_client};
use crate::{BlockPage, BlockSource, BlockSubscription, BlockWithLogs, LogFilter};

/// Validated-stream source: the provider pushes canonical blocks as
/// newline-delimited JSON over a chunked HTTP response, and also serves
/// `/height` and `/query` for backfill, so `provides_validated_data()` is
/// true.
pub struct StreamSource {
    chain_id: u64,
    base_url: String,
    client: reqwest::Client,
    /// Highest block number seen on the stream; backs `latest` between
    /// height polls.
    seen_tip: Arc<AtomicU64>,
    closed: AtomicBool,
}

fn transient(err: impl std::fmt::Display) -> KyomeiError {
    KyomeiError::SourceTransient(err.to_string())
}

impl StreamSource {
    pub fn new(chain_id: u64, url: &str, bearer_token: Option<&str>) -> Result<Self> {
        Ok(Self {
            chain_id,
            base_url: url.trim_end_matches('/').to_string(),
            // No request timeout: the stream response is intentionally
            // unbounded. Backfill queries set their own deadline.
            client: build_client(bearer_token, Duration::from_secs(24 * 60 * 60))?,
            seen_tip: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    async fn height(&self) -> Result<u64> {
        let response = self
            .client
            .get(format!("{}/height", self.base_url))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(transient)?
            .error_for_status()
            .map_err(transient)?;

        let wire: HeightWire = response.json().await.map_err(transient)?;
        Ok(wire.height.max(self.seen_tip.load(Ordering::Relaxed)))
    }
}

#[async_trait]
impl BlockSource for StreamSource {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn provides_validated_data(&self) -> bool {
        true
    }

    async fn latest_block_number(&self) -> Result<u64> {
        self.height().await
    }

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

        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .timeout(Duration::from_secs(30))
            .json(&serde_json::json!({
                "fromBlock": from,
                "toBlock": to,
                "addresses": filter.addresses,
            }))
            .send()
            .await
            .map_err(transient)?
            .error_for_status()
            .map_err(transient)?;

        #[derive(serde::Deserialize)]
        struct QueryResponseWire {
            blocks: Vec<BlockWire>,
        }

        let wire: QueryResponseWire = response.json().await.map_err(transient)?;
        let page = BlockPage {
            from,
            to,
            blocks: wire.blocks.into_iter().map(BlockWire::into_block).collect(),
        };
        page.validate()?;
        Ok(page)
    }

    /// Consume the push stream. Lines that fail to parse are logged and
    /// skipped; a broken stream ends the subscription and the syncer's
    /// retry path reopens it.
    async fn subscribe_blocks(&self) -> Result<BlockSubscription> {
        let response = self
            .client
            .get(format!("{}/stream", self.base_url))
            .send()
            .await
            .map_err(transient)?
            .error_for_status()
            .map_err(transient)?;

        let chain_id = self.chain_id;
        let seen_tip = Arc::clone(&self.seen_tip);
        let (tx, rx) = mpsc::channel(64);

        let task = tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = Vec::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(chain_id, error = %e, "Block stream broke");
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }

                    let block: BlockWithLogs = match serde_json::from_slice::<BlockWire>(line) {
                        Ok(wire) => wire.into_block(),
                        Err(e) => {
                            tracing::warn!(chain_id, error = %e, "Skipping malformed stream line");
                            continue;
                        }
                    };

                    seen_tip.fetch_max(block.number, Ordering::Relaxed);
                    if tx.send(block).await.is_err() {
                        return;
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
