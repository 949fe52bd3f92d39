//! Symbol alias table
//!
//! Tracks, for every face symbol with a lazy call-through installed, the
//! implementation symbol that will hold its compiled body and the
//! namespace that owns it. Records are written once when a unit is added
//! and read by the call-through path and the prediction resolver.
//!
//! Duplicate records and lookups of unrecorded faces are bookkeeping
//! errors, not runtime conditions: a stub cannot exist without its alias
//! record, so a miss on the genuine call path means the engine's own
//! bookkeeping is broken.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::error::{EngineResult, InvariantViolation};
use crate::engine::namespace::Namespace;
use crate::engine::symbol::Symbol;

/// Where a face symbol's body lives
#[derive(Debug, Clone)]
pub struct AliasRecord {
    /// The implementation symbol holding the compiled body
    pub implementation: Symbol,
    /// The namespace that owns the implementation
    pub namespace: Arc<Namespace>,
}

/// Thread-safe face symbol to implementation mapping
pub struct AliasTable {
    records: RwLock<HashMap<Symbol, AliasRecord>>,
}

impl AliasTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Record where a face symbol's implementation lives. Fails fast if the
    /// face already has a record.
    pub fn record(
        &self,
        face: Symbol,
        implementation: Symbol,
        namespace: Arc<Namespace>,
    ) -> EngineResult<()> {
        self.record_batch([(
            face,
            AliasRecord {
                implementation,
                namespace,
            },
        )])
    }

    /// Record a whole unit's aliases under one lock acquisition. Either all
    /// records are installed or, on the first duplicate, none are.
    pub fn record_batch(
        &self,
        batch: impl IntoIterator<Item = (Symbol, AliasRecord)>,
    ) -> EngineResult<()> {
        let batch: Vec<_> = batch.into_iter().collect();
        let mut records = self.records.write();
        for (face, _) in &batch {
            if records.contains_key(face) {
                return Err(InvariantViolation::DuplicateAlias(*face).into());
            }
        }
        for (face, record) in batch {
            records.insert(face, record);
        }
        Ok(())
    }

    /// Look up the implementation for a face symbol. A miss is a
    /// bookkeeping error.
    pub fn lookup(&self, face: Symbol) -> EngineResult<AliasRecord> {
        self.records
            .read()
            .get(&face)
            .cloned()
            .ok_or_else(|| InvariantViolation::UnknownAlias(face).into())
    }

    /// Whether the face symbol has a record
    pub fn contains(&self, face: Symbol) -> bool {
        self.records.read().contains_key(&face)
    }

    /// Number of recorded faces
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        AliasTable::new()
    }
}
