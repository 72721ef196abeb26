//! Schema snapshots and the diff operations derived from comparing two of
//! them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub source_type: String,
    pub is_partition_key: bool,
    pub is_clustering_key: bool,
    pub is_static: bool,
}

/// A point-in-time view of one `(keyspace, table)`'s schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub keyspace: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub version: u64,
}

impl SchemaSnapshot {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        SchemaSnapshot { keyspace: keyspace.into(), table: table.into(), columns, version: 1 }
    }

    pub fn partition_key_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.is_partition_key)
    }

    pub fn clustering_key_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.is_clustering_key)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Compatibility classification stored on each per-column change, per
/// §4.2's classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compatibility {
    Compatible,
    Incompatible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnOp {
    Add { column: ColumnDef, compatibility: Compatibility },
    Drop { column: ColumnDef, compatibility: Compatibility },
    AlterType { name: String, old_type: String, new_type: String, compatibility: Compatibility },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub keyspace: String,
    pub table: String,
    pub from_version: u64,
    pub to_version: u64,
    pub ops: Vec<ColumnOp>,
}

impl SchemaChange {
    pub fn is_incompatible(&self) -> bool {
        incompatible_reason(&self.ops).is_some()
    }
}

/// The `(column, reason)` a destination should refuse `ops` for, or `None`
/// if every op is compatible. A real warehouse rejects an incompatible
/// `ALTER TYPE`/`DROP` at the SQL level; this is shared by both in-memory
/// sink fakes so they model that rejection the same way and surface it as
/// `CdcError::SchemaIncompatible` (§4.2, §7, §8 seed scenario 5).
pub fn incompatible_reason(ops: &[ColumnOp]) -> Option<(String, String)> {
    ops.iter().find_map(|op| match op {
        ColumnOp::Drop { column, compatibility: Compatibility::Incompatible } => {
            Some((column.name.clone(), format!("cannot drop key column {}", column.name)))
        }
        ColumnOp::AlterType { name, old_type, new_type, compatibility: Compatibility::Incompatible } => {
            Some((name.clone(), format!("cannot narrow column {name} from {old_type} to {new_type}")))
        }
        _ => None,
    })
}
