use alloy::dyn_abi::DynSolValue;
use serde_json::{Value, json};

/// Convert a decoded ABI value into JSON.
///
/// Addresses and byte blobs become lowercase hex strings; integers become
/// decimal strings regardless of width so no precision is lost in transit.
pub fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Address(addr) => json!(format!("{addr:#x}")),
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::Uint(v, _) => json!(v.to_string()),
        DynSolValue::Int(v, _) => json!(v.to_string()),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Bytes(bytes) => json!(format!("0x{}", alloy::hex::encode(bytes))),
        DynSolValue::FixedBytes(word, size) => {
            json!(format!("0x{}", alloy::hex::encode(&word.as_slice()[..*size])))
        }
        DynSolValue::Function(f) => json!(format!("0x{}", alloy::hex::encode(f.as_slice()))),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        DynSolValue::Tuple(items) => Value::Array(items.iter().map(to_json).collect()),
    }
}

/// Pull a 20-byte address out of a decoded value, if it is one.
pub fn as_address(value: &DynSolValue) -> Option<String> {
    match value {
        DynSolValue::Address(addr) => Some(format!("{addr:#x}")),
        _ => None,
    }
}
