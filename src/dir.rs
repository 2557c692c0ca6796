use crate::path::{CaseMode, StorePath};
use crate::prelude::*;
use indexmap::IndexMap;
use std::collections::HashSet;

// The in-memory side of the store: normalized path -> slot descriptor.
// Never persisted; rebuilt from the slot walk at open. IndexMap keeps
// insertion order, which makes enumeration deterministic for the lifetime
// of one open, without promising anything stronger.

/// Where an object lives on disk, plus its current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub offset: u64,
    pub capacity: u32,
    /// Byte length of the key image stored in the slot.
    pub key_len: u16,
    /// Current payload length; capacity minus header, key, and this is the
    /// reserve left for growth.
    pub live_len: u32,
    pub version: u32,
}

#[derive(Debug)]
pub struct Directory {
    case: CaseMode,
    entries: IndexMap<StorePath, SlotRef>,
}

impl Directory {
    pub fn new(case: CaseMode) -> Directory {
        Directory {
            case,
            entries: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn lookup(&self, path: &StorePath) -> Option<&SlotRef> {
        self.entries.get(path)
    }

    pub fn lookup_mut(&mut self, path: &StorePath) -> Option<&mut SlotRef> {
        self.entries.get_mut(path)
    }

    /// A key can be added iff the exact path is absent, nothing deeper
    /// makes it a scope, and no ancestor is itself a key. One name never
    /// means both an object and a scope.
    pub fn check_insert(&self, path: &StorePath) -> Result<()> {
        for existing in self.entries.keys() {
            if existing == path || existing.is_under(path) || path.is_under(existing) {
                return Err(StoreError::AlreadyExists {
                    path: path.as_str().to_owned(),
                });
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, path: StorePath, slot: SlotRef) -> Result<()> {
        self.check_insert(&path)?;
        self.entries.insert(path, slot);
        Ok(())
    }

    pub fn remove(&mut self, path: &StorePath) -> Option<SlotRef> {
        self.entries.shift_remove(path)
    }

    pub fn all_keys(&self) -> Vec<String> {
        self.entries.keys().map(|k| k.as_str().to_owned()).collect()
    }

    /// Leaf names of the objects sitting directly in `scope`.
    pub fn keys_in_scope(&self, scope: &StorePath) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| k.is_directly_in(scope))
            .map(|k| k.leaf().to_owned())
            .collect()
    }

    /// Names of the immediate sub-scopes of `scope`, deduplicated under
    /// the store's case mode. The casing of the first key seen wins.
    pub fn subscopes_in_scope(&self, scope: &StorePath) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for k in self.entries.keys() {
            if !k.is_under(scope) || k.is_directly_in(scope) {
                continue;
            }
            // unwrap rationale: is_under guarantees a child segment exists
            let (given, folded) = k.child_toward(scope).unwrap();
            if seen.insert(folded.to_owned()) {
                out.push(given.to_owned());
            }
        }
        out
    }

    /// Full paths of every object anywhere under `scope`.
    pub fn all_objects_under(&self, scope: &StorePath) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| k.is_under(scope))
            .map(|k| k.as_str().to_owned())
            .collect()
    }

    /// Full paths of every object under `scope` whose leaf name matches
    /// `name` under the store's case mode.
    pub fn find_name_under(&self, name: &str, scope: &StorePath) -> Vec<String> {
        let folded = self.case.fold(name);
        self.entries
            .keys()
            .filter(|k| k.is_under(scope) && k.norm_leaf() == folded)
            .map(|k| k.as_str().to_owned())
            .collect()
    }

    /// Drops every entry under `scope`, returning the freed descriptors.
    pub fn remove_scope(&mut self, scope: &StorePath) -> Vec<SlotRef> {
        let doomed: Vec<StorePath> = self
            .entries
            .keys()
            .filter(|k| k.is_under(scope))
            .cloned()
            .collect();
        doomed
            .iter()
            .filter_map(|k| self.entries.shift_remove(k))
            .collect()
    }
}
