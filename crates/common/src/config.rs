use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{KyomeiError, Result};
use crate::types::is_address;

/// Root configuration, loaded from a JSON file with camelCase keys.
///
/// `DATABASE_URL` in the environment overrides
/// `database.connectionString` so deployments can keep credentials out of
/// the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KyomeiConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub contracts: HashMap<String, ContractConfig>,
    #[serde(default)]
    pub crons: Vec<CronConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub connection_string: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub schemas: SchemaNames,
}

/// The three persisted-state schemas. Names are configurable; the defaults
/// below are what a fresh deployment gets.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaNames {
    #[serde(default = "default_sync_schema")]
    pub sync: String,
    #[serde(default = "default_app_schema")]
    pub app: String,
    #[serde(default = "default_crons_schema")]
    pub crons: String,
}

impl Default for SchemaNames {
    fn default() -> Self {
        Self {
            sync: default_sync_schema(),
            app: default_app_schema(),
            crons: default_crons_schema(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub graphql: GraphqlConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            graphql: GraphqlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlConfig {
    #[serde(default = "default_graphql_path")]
    pub path: String,
}

impl Default for GraphqlConfig {
    fn default() -> Self {
        Self {
            path: default_graphql_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub source: SourceConfig,
    /// Poll cadence in milliseconds for sources that poll.
    pub polling_interval: Option<u64>,
    pub finality: Option<Finality>,
}

impl ChainConfig {
    pub fn polling_interval_ms(&self) -> u64 {
        self.polling_interval.unwrap_or(1_000)
    }

    /// Finality depth used by sources that do not provide validated data.
    pub fn finality_depth(&self) -> u64 {
        match &self.finality {
            Some(Finality::Depth(d)) => *d,
            Some(Finality::Level(FinalityLevel::Safe)) => 32,
            Some(Finality::Level(FinalityLevel::Finalized)) => 64,
            None => 10,
        }
    }
}

/// Block-source variants. `rpc` accepts an ordered endpoint list; the extra
/// endpoints are failover targets (the proxied variant).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SourceConfig {
    Rpc {
        urls: Vec<String>,
        #[serde(default)]
        auth: Option<SourceAuth>,
    },
    Archival {
        url: String,
        #[serde(default)]
        auth: Option<SourceAuth>,
    },
    Stream {
        url: String,
        #[serde(default)]
        auth: Option<SourceAuth>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAuth {
    pub bearer_token: Option<String>,
}

/// Numeric depth or a named level.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Finality {
    Depth(u64),
    Level(FinalityLevel),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalityLevel {
    Safe,
    Finalized,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractConfig {
    pub chain: String,
    /// Static deployment address. Mutually exclusive with `factory`.
    pub address: Option<String>,
    pub factory: Option<FactoryConfig>,
    pub abi: AbiSource,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
}

/// How children of a factory are recognized: the parent contract, the
/// creation event it emits, and which event arg carries the child address.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryConfig {
    pub contract: String,
    pub event: String,
    pub child_address_arg: String,
}

/// ABI given inline as a JSON array or as a path to a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AbiSource {
    Path(String),
    Inline(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronConfig {
    pub name: String,
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub schema: CronSchema,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ScheduleConfig {
    /// Cron expression, optionally in a named timezone.
    Time {
        expr: String,
        timezone: Option<String>,
    },
    /// Fires once per block `b` where `(b - offset) % interval == 0`.
    Block {
        chain: String,
        interval: u64,
        #[serde(default)]
        offset: u64,
    },
}

/// Which schema the cron's DB context routes to.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CronSchema {
    #[default]
    Chain,
    Dedicated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Historical worker count; derived from the span size when unset.
    pub workers: Option<usize>,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: None,
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn default_max_connections() -> u32 {
    20
}
fn default_sync_schema() -> String {
    "kyomei_sync".to_string()
}
fn default_app_schema() -> String {
    "kyomei_app".to_string()
}
fn default_crons_schema() -> String {
    "kyomei_crons".to_string()
}
fn default_api_port() -> u16 {
    42069
}
fn default_graphql_path() -> String {
    "/graphql".to_string()
}
fn default_page_size() -> u64 {
    2_000
}

impl KyomeiConfig {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            KyomeiError::Config(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&raw)
    }

    /// Parse, apply env overrides, and validate.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: KyomeiConfig = serde_json::from_str(raw)
            .map_err(|e| KyomeiError::Config(format!("invalid config JSON: {e}")))?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.connection_string = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.connection_string.is_empty() {
            return Err(KyomeiError::Config(
                "database.connectionString is required".into(),
            ));
        }

        for (name, chain) in &self.chains {
            if chain.chain_id == 0 {
                return Err(KyomeiError::Config(format!(
                    "chains.{name}.chainId must be a positive integer"
                )));
            }
            if let SourceConfig::Rpc { urls, .. } = &chain.source
                && urls.is_empty()
            {
                return Err(KyomeiError::Config(format!(
                    "chains.{name}.source.urls must list at least one endpoint"
                )));
            }
        }

        for (name, contract) in &self.contracts {
            if !self.chains.contains_key(&contract.chain) {
                return Err(KyomeiError::Config(format!(
                    "contracts.{name}.chain '{}' is not a configured chain",
                    contract.chain
                )));
            }
            match (&contract.address, &contract.factory) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(KyomeiError::Config(format!(
                        "contracts.{name} must set exactly one of address or factory"
                    )));
                }
                (Some(addr), None) => {
                    if !is_address(&addr.to_ascii_lowercase()) {
                        return Err(KyomeiError::Config(format!(
                            "contracts.{name}.address '{addr}' is not a 20-byte hex address"
                        )));
                    }
                }
                (None, Some(factory)) => {
                    let parent = self.contracts.get(&factory.contract).ok_or_else(|| {
                        KyomeiError::Config(format!(
                            "contracts.{name}.factory.contract '{}' is not configured",
                            factory.contract
                        ))
                    })?;
                    if parent.chain != contract.chain {
                        return Err(KyomeiError::Config(format!(
                            "contracts.{name} and its factory '{}' must share a chain",
                            factory.contract
                        )));
                    }
                }
            }
            if let (Some(start), Some(end)) = (contract.start_block, contract.end_block)
                && end < start
            {
                return Err(KyomeiError::Config(format!(
                    "contracts.{name}: endBlock {end} precedes startBlock {start}"
                )));
            }
        }

        for cron in &self.crons {
            if cron.name.is_empty() {
                return Err(KyomeiError::Config("crons[].name is required".into()));
            }
            if let ScheduleConfig::Block {
                chain, interval, ..
            } = &cron.schedule
            {
                if !self.chains.contains_key(chain) {
                    return Err(KyomeiError::Config(format!(
                        "crons.{}.schedule.chain '{chain}' is not a configured chain",
                        cron.name
                    )));
                }
                if *interval == 0 {
                    return Err(KyomeiError::Config(format!(
                        "crons.{}.schedule.interval must be positive",
                        cron.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Contracts bound to the given chain name.
    pub fn contracts_for_chain<'a>(
        &'a self,
        chain: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a ContractConfig)> {
        self.contracts.iter().filter(move |(_, c)| c.chain == chain)
    }
}
