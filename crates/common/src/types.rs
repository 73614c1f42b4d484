use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Worker id reserved for the tip follower of each chain.
pub const LIVE_WORKER_ID: i32 = 0;

/// Lifecycle of a sync worker lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Historical,
    Live,
    Completed,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Historical => write!(f, "historical"),
            SyncStatus::Live => write!(f, "live"),
            SyncStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Lifecycle of the per-chain process worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Processing,
    Live,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Processing => write!(f, "processing"),
            ProcessStatus::Live => write!(f, "live"),
        }
    }
}

/// Outcome of a single cron run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CronStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for CronStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CronStatus::Running => write!(f, "running"),
            CronStatus::Success => write!(f, "success"),
            CronStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One log in one transaction in one block, as persisted.
///
/// Rows are immutable once committed; the primary key is
/// `(chain_id, block_number, tx_index, log_index)`. Addresses and hashes are
/// stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_index: u32,
    pub log_index: u32,
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    pub tx_hash: String,
    pub address: String,
    pub topic0: String,
    pub topic1: Option<String>,
    pub topic2: Option<String>,
    pub topic3: Option<String>,
    pub data: String,
}

/// A persisted sync-worker lease over a block range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncWorker {
    pub chain_id: u64,
    pub worker_id: i32,
    pub range_start: u64,
    /// `None` for the live worker.
    pub range_end: Option<u64>,
    pub current_block: u64,
    pub status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncWorker {
    /// A historical worker that stopped short of its range end can be
    /// resumed from the block after its checkpoint.
    pub fn is_resumable(&self) -> bool {
        match (self.status, self.range_end) {
            (SyncStatus::Historical, Some(end)) => self.current_block < end,
            _ => false,
        }
    }
}

/// The per-chain processing checkpoint row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessWorker {
    pub chain_id: u64,
    pub range_start: u64,
    pub range_end: Option<u64>,
    pub current_block: u64,
    pub events_processed: u64,
    pub status: ProcessStatus,
    pub updated_at: DateTime<Utc>,
}

/// A dynamically discovered child contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryChild {
    pub chain_id: u64,
    pub child_address: String,
    pub factory_address: String,
    pub contract_name: String,
    pub discovered_block: u64,
    pub discovered_tx: String,
    pub child_abi: Option<String>,
}

/// A deterministic RPC response pinned to a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCacheRow {
    pub chain_id: u64,
    pub block_number: u64,
    pub request_hash: String,
    pub method: String,
    pub params: serde_json::Value,
    pub response: serde_json::Value,
}

/// A single cron run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExecution {
    pub id: Uuid,
    pub job_name: String,
    pub status: CronStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

/// Last block a block-interval cron fired for, per (job, chain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronCheckpoint {
    pub job_name: String,
    pub chain_id: u64,
    pub last_block_number: u64,
    pub updated_at: DateTime<Utc>,
}

/// Pub/sub channel names carried over the database's native channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    BlockRangeSynced,
    LiveBlockSynced,
    FactoryChildDiscovered,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::BlockRangeSynced => "block_range_synced",
            Channel::LiveBlockSynced => "live_block_synced",
            Channel::FactoryChildDiscovered => "factory_child_discovered",
        }
    }

    pub fn all() -> [Channel; 3] {
        [
            Channel::BlockRangeSynced,
            Channel::LiveBlockSynced,
            Channel::FactoryChildDiscovered,
        ]
    }

    pub fn from_name(name: &str) -> Option<Channel> {
        match name {
            "block_range_synced" => Some(Channel::BlockRangeSynced),
            "live_block_synced" => Some(Channel::LiveBlockSynced),
            "factory_child_discovered" => Some(Channel::FactoryChildDiscovered),
            _ => None,
        }
    }
}

/// Canonical payload published on every channel.
///
/// Block numbers travel as decimal strings so consumers never lose precision
/// in JSON number parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: Channel,
    pub chain_id: u64,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BusMessageWire {
    #[serde(rename = "type")]
    kind: String,
    chain_id: u64,
    block_number: String,
    timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(channel: Channel, chain_id: u64, block_number: u64) -> Self {
        Self {
            channel,
            chain_id,
            block_number,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        let wire = BusMessageWire {
            kind: self.channel.name().to_string(),
            chain_id: self.chain_id,
            block_number: self.block_number.to_string(),
            timestamp: self.timestamp,
        };
        serde_json::to_string(&wire).unwrap_or_default()
    }

    pub fn from_json(payload: &str) -> Option<Self> {
        let wire: BusMessageWire = serde_json::from_str(payload).ok()?;
        Some(Self {
            channel: Channel::from_name(&wire.kind)?,
            chain_id: wire.chain_id,
            block_number: wire.block_number.parse().ok()?,
            timestamp: wire.timestamp,
        })
    }
}

/// Lowercase an address or hash for storage and comparison.
pub fn normalize_hex(value: &str) -> String {
    value.to_ascii_lowercase()
}

/// Cheap shape check for a 20-byte hex address.
pub fn is_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_message_round_trip() {
        let msg = BusMessage::new(Channel::BlockRangeSynced, 1, 18_000_000);
        let json = msg.to_json();
        assert!(json.contains("\"blockNumber\":\"18000000\""));
        assert!(json.contains("\"type\":\"block_range_synced\""));

        let back = BusMessage::from_json(&json).unwrap();
        assert_eq!(back.chain_id, 1);
        assert_eq!(back.block_number, 18_000_000);
        assert_eq!(back.channel, Channel::BlockRangeSynced);
    }

    #[test]
    fn bus_message_rejects_unknown_channel() {
        let json = r#"{"type":"something_else","chainId":1,"blockNumber":"5","timestamp":"2024-01-01T00:00:00Z"}"#;
        assert!(BusMessage::from_json(json).is_none());
    }

    #[test]
    fn resumable_workers() {
        let mut worker = SyncWorker {
            chain_id: 1,
            worker_id: 3,
            range_start: 100,
            range_end: Some(200),
            current_block: 150,
            status: SyncStatus::Historical,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(worker.is_resumable());

        worker.current_block = 200;
        assert!(!worker.is_resumable());

        worker.status = SyncStatus::Completed;
        assert!(!worker.is_resumable());
    }

    #[test]
    fn address_shape() {
        assert!(is_address("0x7a250d5630b4cf539739df2c5dacb4c659f2488d"));
        assert!(!is_address("0x7a25"));
        assert!(!is_address("7a250d5630b4cf539739df2c5dacb4c659f2488dxx"));
    }
}
