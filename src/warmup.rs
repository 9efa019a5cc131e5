use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::fields::{FieldMask, MatchField};
use crate::protocol::Identifier;

/// A warm-up rule restricting when a local address may be used.
///
/// `values` holds one expected message value per field in `fields`, in
/// canonical field order. An empty mask matches every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupPredicate {
    pub owner: Identifier,
    pub local_address: String,
    pub fields: FieldMask,
    pub values: Vec<String>,
}

impl WarmupPredicate {
    pub fn new(owner: Identifier, local_address: impl Into<String>, fields: FieldMask, values: Vec<String>) -> Self {
        WarmupPredicate {
            owner,
            local_address: local_address.into(),
            fields,
            values,
        }
    }

    /// True when every compared field of the message equals the stored value.
    pub fn matches<F>(&self, attribute: F) -> bool
    where
        F: FnMut(MatchField) -> String,
    {
        self.matches_cached(&mut HashMap::new(), attribute)
    }

    /// Like `matches`, but reads attributes through `cache`, fetching a field
    /// only the first time any predicate sharing the cache asks for it.
    pub fn matches_cached<F>(&self, cache: &mut HashMap<MatchField, String>, mut fetch: F) -> bool
    where
        F: FnMut(MatchField) -> String,
    {
        if self.fields.compared().count() != self.values.len() {
            return false;
        }
        self.fields
            .compared()
            .zip(&self.values)
            .all(|(field, expected)| *cache.entry(field).or_insert_with(|| fetch(field)) == *expected)
    }
}

/// Local address -> warm-up predicates registered for it.
///
/// Written by the sync worker, read by every queue insert. Cloning shares the
/// same underlying map.
#[derive(Debug, Clone, Default)]
pub struct WarmupIndex {
    buckets: Arc<RwLock<HashMap<String, Vec<WarmupPredicate>>>>,
}

impl WarmupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<WarmupPredicate>>> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<WarmupPredicate>>> {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `predicate` under its local address, replacing any predicate
    /// previously registered for the same owner.
    pub fn upsert(&self, predicate: WarmupPredicate) {
        let mut buckets = self.write();
        remove_owned(&mut buckets, &predicate.owner);
        buckets
            .entry(predicate.local_address.clone())
            .or_default()
            .push(predicate);
    }

    /// Drops the predicate owned by `owner`. Returns whether one was found.
    pub fn remove_by_identifier(&self, owner: &Identifier) -> bool {
        remove_owned(&mut self.write(), owner)
    }

    pub fn lookup(&self, local_address: &str) -> Vec<WarmupPredicate> {
        self.read()
            .get(local_address)
            .cloned()
            .unwrap_or_default()
    }

    /// Evaluates the predicates registered for `local_address` in place.
    /// `None` when the address has none, otherwise whether any matched.
    pub fn evaluate<F>(
        &self,
        local_address: &str,
        cache: &mut HashMap<MatchField, String>,
        mut fetch: F,
    ) -> Option<bool>
    where
        F: FnMut(MatchField) -> String,
    {
        let buckets = self.read();
        let predicates = buckets.get(local_address).filter(|bucket| !bucket.is_empty())?;
        Some(
            predicates
                .iter()
                .any(|predicate| predicate.matches_cached(cache, &mut fetch)),
        )
    }

    pub fn contains(&self, owner: &Identifier) -> bool {
        self.read()
            .values()
            .flatten()
            .any(|predicate| &predicate.owner == owner)
    }

    pub fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All predicates, sorted by address then registration order.
    pub fn snapshot(&self) -> Vec<WarmupPredicate> {
        let buckets = self.read();
        let mut addresses: Vec<&String> = buckets.keys().collect();
        addresses.sort();
        addresses
            .into_iter()
            .flat_map(|address| buckets[address].iter().cloned())
            .collect()
    }
}

fn remove_owned(buckets: &mut HashMap<String, Vec<WarmupPredicate>>, owner: &Identifier) -> bool {
    let Some((address, position)) = buckets.iter().find_map(|(address, predicates)| {
        predicates
            .iter()
            .position(|predicate| &predicate.owner == owner)
            .map(|position| (address.clone(), position))
    }) else {
        return false;
    };

    if let Some(predicates) = buckets.get_mut(&address) {
        predicates.remove(position);
        if predicates.is_empty() {
            buckets.remove(&address);
        }
    }
    true
}
