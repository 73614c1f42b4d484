use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use kyomei_common::types::FactoryChild;

/// What a filter snapshot knows about one discovered child.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub contract_name: String,
    pub discovered_block: u64,
}

/// Immutable view of the watched address set at a point in time.
#[derive(Debug, Default)]
pub struct FilterSnapshot {
    addresses: HashSet<String>,
    children: HashMap<String, ChildEntry>,
}

impl FilterSnapshot {
    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(address)
    }

    pub fn child(&self, address: &str) -> Option<&ChildEntry> {
        self.children.get(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.addresses.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Copy-on-write watched-address set, shared per chain.
///
/// Readers grab an `Arc` snapshot and never block writers; writers rebuild
/// the set and swap the pointer. Mutation only happens on factory discovery
/// and on peer-process refresh, both rare.
#[derive(Clone)]
pub struct FilterSet {
    static_addresses: Vec<String>,
    current: Arc<RwLock<Arc<FilterSnapshot>>>,
}

impl FilterSet {
    pub fn new(static_addresses: Vec<String>) -> Self {
        let static_addresses: Vec<String> = static_addresses
            .into_iter()
            .map(|a| a.to_ascii_lowercase())
            .collect();

        let snapshot = build(&static_addresses, &HashMap::new());
        Self {
            static_addresses,
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn snapshot(&self) -> Arc<FilterSnapshot> {
        self.current.read().expect("filter lock poisoned").clone()
    }

    /// Add one discovered child and swap the snapshot.
    pub fn add_child(&self, child: &FactoryChild) {
        let mut guard = self.current.write().expect("filter lock poisoned");
        let mut children = guard.children.clone();
        children.insert(
            child.child_address.to_ascii_lowercase(),
            ChildEntry {
                contract_name: child.contract_name.clone(),
                discovered_block: child.discovered_block,
            },
        );
        *guard = Arc::new(build(&self.static_addresses, &children));
    }

    /// Replace the child set wholesale, e.g. after a peer-process discovery
    /// notification re-reads the registry table.
    pub fn replace_children(&self, children: impl IntoIterator<Item = FactoryChild>) {
        let children: HashMap<String, ChildEntry> = children
            .into_iter()
            .map(|c| {
                (
                    c.child_address.to_ascii_lowercase(),
                    ChildEntry {
                        contract_name: c.contract_name,
                        discovered_block: c.discovered_block,
                    },
                )
            })
            .collect();

        let mut guard = self.current.write().expect("filter lock poisoned");
        *guard = Arc::new(build(&self.static_addresses, &children));
    }
}

fn build(static_addresses: &[String], children: &HashMap<String, ChildEntry>) -> FilterSnapshot {
    let mut addresses: HashSet<String> = static_addresses.iter().cloned().collect();
    addresses.extend(children.keys().cloned());
    FilterSnapshot {
        addresses,
        children: children.clone(),
    }
}
