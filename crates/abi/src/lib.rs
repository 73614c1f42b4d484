//! ABI registry and log decoding.
//!
//! Contracts are declared in config with a user-supplied JSON ABI. The
//! registry indexes their events by name and by `topic0` so the syncer can
//! recognize factory-creation events and the processor can decode raw rows
//! into named args.

pub mod registry;
pub mod value;

pub use registry::{AbiRegistry, ContractAbi, DecodedEventData, DecodedParam, FactoryWatch};
