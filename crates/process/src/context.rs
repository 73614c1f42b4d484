use chrono::{DateTime, Utc};

use kyomei_abi::DecodedEventData;
use kyomei_common::types::RawEvent;

use crate::db_ctx::DbContext;
use crate::rpc_ctx::CachedRpc;

#[derive(Debug, Clone)]
pub struct EventBlock {
    pub number: u64,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventTransaction {
    pub hash: String,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    pub index: u32,
    /// Emitting contract, lowercase.
    pub address: String,
}

/// One decoded event as handlers see it. Addresses are lowercase; integer
/// args wider than 64 bits are decimal strings.
#[derive(Debug, Clone)]
pub struct DecodedLogEvent {
    pub contract: String,
    pub name: String,
    /// Args as a JSON object keyed by ABI param name.
    pub args: serde_json::Value,
    pub block: EventBlock,
    pub transaction: EventTransaction,
    pub log: EventLog,
}

impl DecodedLogEvent {
    pub fn new(raw: &RawEvent, decoded: &DecodedEventData) -> Self {
        Self {
            contract: decoded.contract.clone(),
            name: decoded.event.clone(),
            args: decoded.args_json(),
            block: EventBlock {
                number: raw.block_number,
                hash: raw.block_hash.clone(),
                timestamp: raw.block_timestamp,
            },
            transaction: EventTransaction {
                hash: raw.tx_hash.clone(),
                index: raw.tx_index,
            },
            log: EventLog {
                index: raw.log_index,
                address: raw.address.clone(),
            },
        }
    }

    pub fn arg(&self, name: &str) -> Option<&serde_json::Value> {
        self.args.get(name)
    }
}

/// What a handler receives per event: the decoded payload, the block's
/// shared transaction through the CRUD surface, and the replay-stable RPC
/// client pinned to the event's block.
#[derive(Clone)]
pub struct EventContext {
    pub event: DecodedLogEvent,
    pub db: DbContext,
    pub rpc: CachedRpc,
}
