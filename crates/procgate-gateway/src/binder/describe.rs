//! Process-lifetime cache of learned procedure shapes

use super::CallMode;
use crate::driver::{ArgShape, ProcedureSignature};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Bind shape learned for one procedure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescribeEntry {
    /// Whether the procedure takes the two-argument (names, values) flexible
    /// form; unknown until a flexible call was reconciled
    pub reduced_flexible: Option<bool>,
    /// Lowercased argument names that must be bound as collections
    pub collection_args: BTreeSet<String>,
    /// Lowercased names of large-object arguments
    pub lob_args: BTreeSet<String>,
    /// Positions of large-object arguments among the non-cursor arguments
    pub lob_positions: BTreeSet<usize>,
}

impl DescribeEntry {
    /// Large-object arguments of a described signature
    pub fn from_signature(signature: &ProcedureSignature) -> Self {
        let mut entry = DescribeEntry::default();
        let declared = signature.args.iter().filter(|a| a.shape != ArgShape::Cursor);
        for (position, arg) in declared.enumerate() {
            if arg.shape == ArgShape::LargeObject {
                entry.lob_args.insert(arg.name.to_ascii_lowercase());
                entry.lob_positions.insert(position);
            }
        }
        entry
    }

    pub fn must_be_collection(&self, name: &str) -> bool {
        self.collection_args.contains(&name.to_ascii_lowercase())
    }

    /// Whether the argument `name` at `position` takes a large object
    pub fn is_large_object(&self, name: &str, position: usize, mode: CallMode) -> bool {
        match mode {
            CallMode::Positional => self.lob_positions.contains(&position),
            _ => self.lob_args.contains(&name.to_ascii_lowercase()),
        }
    }

    fn merged(&self, other: &DescribeEntry) -> DescribeEntry {
        let union = |a: &BTreeSet<String>, b: &BTreeSet<String>| a.union(b).cloned().collect();
        DescribeEntry {
            reduced_flexible: other.reduced_flexible.or(self.reduced_flexible),
            collection_args: union(&self.collection_args, &other.collection_args),
            lob_args: union(&self.lob_args, &other.lob_args),
            lob_positions: self.lob_positions.union(&other.lob_positions).copied().collect(),
        }
    }
}

/// Describe cache shared by all requests of a location
///
/// Entries are immutable once visible; a merge swaps in a new `Arc` under
/// the shard lock, so readers never block on each other.
#[derive(Debug, Default)]
pub struct DescribeCache {
    entries: DashMap<String, Arc<DescribeEntry>>,
}

impl DescribeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(procedure: &str) -> String {
        procedure.to_ascii_lowercase()
    }

    pub fn get(&self, procedure: &str) -> Option<Arc<DescribeEntry>> {
        self.entries
            .get(&Self::key(procedure))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Record a learned shape, adding to whatever was known before
    pub fn merge(&self, procedure: &str, learned: DescribeEntry) -> Arc<DescribeEntry> {
        let mut slot = self
            .entries
            .entry(Self::key(procedure))
            .or_insert_with(|| Arc::new(DescribeEntry::default()));
        let merged = Arc::new(slot.value().merged(&learned));
        *slot.value_mut() = Arc::clone(&merged);
        debug!(
            procedure,
            collections = merged.collection_args.len(),
            reduced = ?merged.reduced_flexible,
            "Describe cache updated"
        );
        merged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
