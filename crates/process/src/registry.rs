use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use kyomei_abi::AbiRegistry;
use kyomei_common::error::{KyomeiError, Result};

use crate::context::EventContext;

/// User handler: an async function over the event + db/rpc context.
pub type Handler = Arc<dyn Fn(EventContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How a handler's effects relate to its siblings within one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One at a time, in registration order, across all events of a block.
    Sequential,
    /// May interleave with other parallel handlers of the same block.
    Parallel,
}

#[derive(Clone)]
pub struct Registration {
    pub contract: String,
    pub event: String,
    pub mode: DispatchMode,
    /// Stable name for the per-handler checkpoint row.
    pub name: String,
    pub handler: Handler,
}

/// Handlers keyed by `"Contract:Event"`. Registration validates the key
/// against the chain's contract set up front, so typos fail at startup
/// rather than as silently dead handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_key: HashMap<String, Vec<Registration>>,
    count: usize,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, abis: &AbiRegistry, key: &str, handler: Handler) -> Result<()> {
        self.register(abis, key, DispatchMode::Sequential, handler)
    }

    pub fn on_parallel(&mut self, abis: &AbiRegistry, key: &str, handler: Handler) -> Result<()> {
        self.register(abis, key, DispatchMode::Parallel, handler)
    }

    fn register(
        &mut self,
        abis: &AbiRegistry,
        key: &str,
        mode: DispatchMode,
        handler: Handler,
    ) -> Result<()> {
        let (contract, event) = parse_key(key)?;

        let abi = abis
            .contract(&contract)
            .ok_or_else(|| KyomeiError::UnknownContract(contract.clone()))?;
        if !abi.has_event(&event) {
            return Err(KyomeiError::UnknownEvent { contract, event });
        }

        let entry = self.by_key.entry(key.to_string()).or_default();
        let name = format!("{key}#{}", entry.len());
        entry.push(Registration {
            contract,
            event,
            mode,
            name,
            handler,
        });
        self.count += 1;
        Ok(())
    }

    pub fn handlers(&self, key: &str) -> &[Registration] {
        self.by_key.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Split `"Contract:Event"`; anything else is a named registration error.
fn parse_key(key: &str) -> Result<(String, String)> {
    match key.split_once(':') {
        Some((contract, event))
            if !contract.is_empty() && !event.is_empty() && !event.contains(':') =>
        {
            Ok((contract.to_string(), event.to_string()))
        }
        _ => Err(KyomeiError::InvalidHandlerKey(key.to_string())),
    }
}
