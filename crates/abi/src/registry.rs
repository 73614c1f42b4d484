use std::collections::HashMap;
use std::str::FromStr;

use alloy::dyn_abi::EventExt;
use alloy::json_abi::{Event, JsonAbi};
use alloy::primitives::B256;
use serde_json::Value;

use kyomei_common::config::{AbiSource, KyomeiConfig};
use kyomei_common::error::{KyomeiError, Result};
use kyomei_common::types::RawEvent;

use crate::value;

/// One configured contract with its parsed ABI and event indexes.
#[derive(Debug, Clone)]
pub struct ContractAbi {
    pub name: String,
    /// Static deployment address, lowercase. `None` for factory children,
    /// whose addresses come from the factory registry at runtime.
    pub address: Option<String>,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub abi: JsonAbi,
    events_by_name: HashMap<String, Event>,
    events_by_topic: HashMap<String, Event>,
}

impl ContractAbi {
    pub fn event(&self, name: &str) -> Option<&Event> {
        self.events_by_name.get(name)
    }

    pub fn event_by_topic(&self, topic0: &str) -> Option<&Event> {
        self.events_by_topic.get(topic0)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events_by_name.contains_key(name)
    }
}

/// A factory declaration resolved against its parent's ABI: which address
/// and topic identify creation events, and which arg carries the child.
#[derive(Debug, Clone)]
pub struct FactoryWatch {
    /// Name of the configured child contract (e.g. "Pair").
    pub child_contract: String,
    pub parent_contract: String,
    pub parent_address: String,
    pub event_name: String,
    pub topic0: String,
    pub child_address_arg: String,
    event: Event,
}

impl FactoryWatch {
    /// Does this raw row look like a creation event from this factory?
    pub fn matches(&self, raw: &RawEvent) -> bool {
        raw.address == self.parent_address && raw.topic0 == self.topic0
    }

    /// Decode the creation event and pull out the child address (lowercase).
    pub fn extract_child(&self, raw: &RawEvent) -> Result<String> {
        let params = decode_params(&self.event, raw)?;
        let param = params
            .iter()
            .find(|p| p.name == self.child_address_arg)
            .ok_or_else(|| {
                KyomeiError::Decode(format!(
                    "factory event {} has no arg '{}'",
                    self.event_name, self.child_address_arg
                ))
            })?;
        match &param.value {
            Value::String(s) if kyomei_common::types::is_address(s) => Ok(s.clone()),
            other => Err(KyomeiError::Decode(format!(
                "factory arg '{}' is not an address: {other}",
                self.child_address_arg
            ))),
        }
    }
}

/// A single decoded event argument in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedParam {
    pub name: String,
    pub value: Value,
    pub indexed: bool,
}

/// A raw row decoded against its contract's ABI.
#[derive(Debug, Clone)]
pub struct DecodedEventData {
    pub contract: String,
    pub event: String,
    pub params: Vec<DecodedParam>,
}

impl DecodedEventData {
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Args as a JSON object keyed by param name.
    pub fn args_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for p in &self.params {
            map.insert(p.name.clone(), p.value.clone());
        }
        Value::Object(map)
    }

    /// The dispatch key handlers register under.
    pub fn handler_key(&self) -> String {
        format!("{}:{}", self.contract, self.event)
    }
}

/// All contracts configured for one chain, indexed for the syncer and the
/// processor.
#[derive(Debug, Clone)]
pub struct AbiRegistry {
    chain: String,
    contracts: HashMap<String, ContractAbi>,
    by_address: HashMap<String, String>,
    factories: Vec<FactoryWatch>,
}

impl AbiRegistry {
    /// Build the registry for one configured chain, loading and parsing
    /// every bound contract's ABI. Fails fast on unreadable or invalid ABIs
    /// and on factory declarations whose parent lacks the named event.
    pub fn build(config: &KyomeiConfig, chain_name: &str) -> Result<Self> {
        let mut contracts = HashMap::new();
        let mut by_address = HashMap::new();
        let mut factories = Vec::new();

        for (name, contract_cfg) in config.contracts_for_chain(chain_name) {
            let abi = load_abi(name, &contract_cfg.abi)?;

            let mut events_by_name = HashMap::new();
            let mut events_by_topic = HashMap::new();
            for event in abi.events() {
                if event.anonymous {
                    continue;
                }
                let topic0 = format!("{:#x}", event.selector());
                events_by_name.insert(event.name.clone(), event.clone());
                events_by_topic.insert(topic0, event.clone());
            }

            let address = contract_cfg
                .address
                .as_ref()
                .map(|a| a.to_ascii_lowercase());
            if let Some(addr) = &address {
                by_address.insert(addr.clone(), name.clone());
            }

            contracts.insert(
                name.clone(),
                ContractAbi {
                    name: name.clone(),
                    address,
                    start_block: contract_cfg.start_block,
                    end_block: contract_cfg.end_block,
                    abi,
                    events_by_name,
                    events_by_topic,
                },
            );
        }

        // Resolve factory declarations once every ABI is indexed.
        for (name, contract_cfg) in config.contracts_for_chain(chain_name) {
            let Some(factory_cfg) = &contract_cfg.factory else {
                continue;
            };
            let parent = contracts.get(&factory_cfg.contract).ok_or_else(|| {
                KyomeiError::UnknownContract(factory_cfg.contract.clone())
            })?;
            let parent_address = parent.address.clone().ok_or_else(|| {
                KyomeiError::Config(format!(
                    "factory parent '{}' must have a static address",
                    factory_cfg.contract
                ))
            })?;
            let event = parent.event(&factory_cfg.event).ok_or_else(|| {
                KyomeiError::UnknownEvent {
                    contract: factory_cfg.contract.clone(),
                    event: factory_cfg.event.clone(),
                }
            })?;

            factories.push(FactoryWatch {
                child_contract: name.clone(),
                parent_contract: factory_cfg.contract.clone(),
                parent_address,
                event_name: factory_cfg.event.clone(),
                topic0: format!("{:#x}", event.selector()),
                child_address_arg: factory_cfg.child_address_arg.clone(),
                event: event.clone(),
            });
        }

        Ok(Self {
            chain: chain_name.to_string(),
            contracts,
            by_address,
            factories,
        })
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn contract(&self, name: &str) -> Option<&ContractAbi> {
        self.contracts.get(name)
    }

    /// Resolve a statically configured contract by its lowercase address.
    pub fn contract_by_address(&self, address: &str) -> Option<&ContractAbi> {
        self.by_address
            .get(address)
            .and_then(|name| self.contracts.get(name))
    }

    pub fn factories(&self) -> &[FactoryWatch] {
        &self.factories
    }

    /// All static addresses, lowercase, for the initial log-filter set.
    pub fn static_addresses(&self) -> Vec<String> {
        self.by_address.keys().cloned().collect()
    }

    /// Earliest configured start block across this chain's contracts.
    pub fn earliest_start_block(&self) -> Option<u64> {
        self.contracts.values().filter_map(|c| c.start_block).min()
    }

    /// Decode a raw row against the named contract's ABI. Rows whose topic0
    /// is not in the ABI are a decode error the processor logs and skips.
    pub fn decode(&self, contract_name: &str, raw: &RawEvent) -> Result<DecodedEventData> {
        let contract = self
            .contracts
            .get(contract_name)
            .ok_or_else(|| KyomeiError::UnknownContract(contract_name.to_string()))?;
        let event = contract.event_by_topic(&raw.topic0).ok_or_else(|| {
            KyomeiError::Decode(format!(
                "no event with topic {} in ABI of '{contract_name}'",
                raw.topic0
            ))
        })?;

        let params = decode_params(event, raw)?;
        Ok(DecodedEventData {
            contract: contract_name.to_string(),
            event: event.name.clone(),
            params,
        })
    }
}

fn load_abi(contract: &str, source: &AbiSource) -> Result<JsonAbi> {
    let value: Value = match source {
        AbiSource::Inline(value) => value.clone(),
        AbiSource::Path(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                KyomeiError::Config(format!("cannot read ABI for '{contract}' at {path}: {e}"))
            })?;
            serde_json::from_str(&raw).map_err(|e| {
                KyomeiError::Config(format!("ABI file for '{contract}' is not JSON: {e}"))
            })?
        }
    };
    serde_json::from_value(value)
        .map_err(|e| KyomeiError::Config(format!("invalid ABI for '{contract}': {e}")))
}

/// Decode topics + data into args in declaration order.
fn decode_params(event: &Event, raw: &RawEvent) -> Result<Vec<DecodedParam>> {
    let mut topics = Vec::with_capacity(4);
    for topic in [Some(&raw.topic0), raw.topic1.as_ref(), raw.topic2.as_ref(), raw.topic3.as_ref()]
        .into_iter()
        .flatten()
    {
        let parsed = B256::from_str(topic)
            .map_err(|e| KyomeiError::Decode(format!("bad topic {topic}: {e}")))?;
        topics.push(parsed);
    }

    let data = alloy::hex::decode(raw.data.trim_start_matches("0x"))
        .map_err(|e| KyomeiError::Decode(format!("bad log data: {e}")))?;

    let decoded = event
        .decode_log_parts(topics, &data)
        .map_err(|e| KyomeiError::Decode(format!("cannot decode {}: {e}", event.name)))?;

    let mut indexed = decoded.indexed.into_iter();
    let mut body = decoded.body.into_iter();
    let mut params = Vec::with_capacity(event.inputs.len());
    for (i, input) in event.inputs.iter().enumerate() {
        let value = if input.indexed {
            indexed.next()
        } else {
            body.next()
        }
        .ok_or_else(|| {
            KyomeiError::Decode(format!("decoded arity mismatch for {}", event.name))
        })?;

        let name = if input.name.is_empty() {
            format!("arg{i}")
        } else {
            input.name.clone()
        };
        params.push(DecodedParam {
            name,
            value: value::to_json(&value),
            indexed: input.indexed,
        });
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const CONFIG: &str = r#"{
        "database": { "connectionString": "postgres://localhost/kyomei" },
        "chains": {
            "mainnet": {
                "chainId": 1,
                "source": { "kind": "rpc", "urls": ["http://localhost:8545"] }
            }
        },
        "contracts": {
            "Token": {
                "chain": "mainnet",
                "address": "0x1111111111111111111111111111111111111111",
                "abi": [
                    { "type": "event", "name": "Transfer", "anonymous": false, "inputs": [
                        { "indexed": true, "name": "from", "type": "address" },
                        { "indexed": true, "name": "to", "type": "address" },
                        { "indexed": false, "name": "value", "type": "uint256" }
                    ] }
                ],
                "startBlock": 100
            },
            "Factory": {
                "chain": "mainnet",
                "address": "0x2222222222222222222222222222222222222222",
                "abi": [
                    { "type": "event", "name": "PairCreated", "anonymous": false, "inputs": [
                        { "indexed": true, "name": "token0", "type": "address" },
                        { "indexed": true, "name": "token1", "type": "address" },
                        { "indexed": false, "name": "pair", "type": "address" },
                        { "indexed": false, "name": "", "type": "uint256" }
                    ] }
                ],
                "startBlock": 150
            },
            "Pair": {
                "chain": "mainnet",
                "factory": {
                    "contract": "Factory",
                    "event": "PairCreated",
                    "childAddressArg": "pair"
                },
                "abi": [
                    { "type": "event", "name": "Sync", "anonymous": false, "inputs": [
                        { "indexed": false, "name": "reserve0", "type": "uint112" },
                        { "indexed": false, "name": "reserve1", "type": "uint112" }
                    ] }
                ]
            }
        }
    }"#;

    fn registry() -> AbiRegistry {
        let config = KyomeiConfig::from_json(CONFIG).unwrap();
        AbiRegistry::build(&config, "mainnet").unwrap()
    }

    fn pad_address(addr: &str) -> String {
        format!("0x{:0>64}", addr.trim_start_matches("0x"))
    }

    fn raw(address: &str, topic0: String, topics: Vec<String>, data: String) -> RawEvent {
        let mut t = topics.into_iter();
        RawEvent {
            chain_id: 1,
            block_number: 160,
            tx_index: 0,
            log_index: 0,
            block_hash: format!("0x{}", "a".repeat(64)),
            block_timestamp: Utc::now(),
            tx_hash: format!("0x{}", "b".repeat(64)),
            address: address.to_string(),
            topic0,
            topic1: t.next(),
            topic2: t.next(),
            topic3: t.next(),
            data,
        }
    }

    #[test]
    fn builds_indexes() {
        let reg = registry();
        assert!(reg.contract("Token").unwrap().has_event("Transfer"));
        assert!(reg.contract_by_address("0x1111111111111111111111111111111111111111").is_some());
        assert!(reg.contract_by_address("0x3333333333333333333333333333333333333333").is_none());
        assert_eq!(reg.factories().len(), 1);
        assert_eq!(reg.earliest_start_block(), Some(100));

        let mut addrs = reg.static_addresses();
        addrs.sort();
        assert_eq!(
            addrs,
            vec![
                "0x1111111111111111111111111111111111111111",
                "0x2222222222222222222222222222222222222222"
            ]
        );
    }

    #[test]
    fn decodes_transfer() {
        let reg = registry();
        let topic0 = reg.contract("Token").unwrap().event("Transfer").unwrap().selector();
        let from = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let to = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

        let event = raw(
            "0x1111111111111111111111111111111111111111",
            format!("{topic0:#x}"),
            vec![pad_address(from), pad_address(to)],
            format!("0x{:064x}", 1_000_000u64),
        );

        let decoded = reg.decode("Token", &event).unwrap();
        assert_eq!(decoded.event, "Transfer");
        assert_eq!(decoded.handler_key(), "Token:Transfer");
        assert_eq!(decoded.arg("from").unwrap().as_str(), Some(from));
        assert_eq!(decoded.arg("to").unwrap().as_str(), Some(to));
        assert_eq!(decoded.arg("value").unwrap().as_str(), Some("1000000"));
    }

    #[test]
    fn unnamed_params_get_positional_names() {
        let reg = registry();
        let topic0 = reg
            .contract("Factory")
            .unwrap()
            .event("PairCreated")
            .unwrap()
            .selector();
        let pair = "0xcccccccccccccccccccccccccccccccccccccccc";

        let event = raw(
            "0x2222222222222222222222222222222222222222",
            format!("{topic0:#x}"),
            vec![
                pad_address("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
                pad_address("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            ],
            format!("{}{:064x}", pad_address(pair), 1u64),
        );

        let decoded = reg.decode("Factory", &event).unwrap();
        assert_eq!(decoded.arg("pair").unwrap().as_str(), Some(pair));
        assert_eq!(decoded.arg("arg3").unwrap().as_str(), Some("1"));
    }

    #[test]
    fn factory_watch_extracts_child() {
        let reg = registry();
        let watch = &reg.factories()[0];
        assert_eq!(watch.child_contract, "Pair");
        assert_eq!(watch.parent_address, "0x2222222222222222222222222222222222222222");

        let pair = "0xcccccccccccccccccccccccccccccccccccccccc";
        let event = raw(
            "0x2222222222222222222222222222222222222222",
            watch.topic0.clone(),
            vec![
                pad_address("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
                pad_address("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            ],
            format!("{}{:064x}", pad_address(pair), 1u64),
        );

        assert!(watch.matches(&event));
        assert_eq!(watch.extract_child(&event).unwrap(), pair);
    }

    #[test]
    fn decode_unknown_topic_fails() {
        let reg = registry();
        let event = raw(
            "0x1111111111111111111111111111111111111111",
            format!("0x{}", "f".repeat(64)),
            vec![],
            "0x".to_string(),
        );
        assert!(matches!(
            reg.decode("Token", &event),
            Err(KyomeiError::Decode(_))
        ));
    }
}
