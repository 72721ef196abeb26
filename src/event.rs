//! C1 — the immutable record of one row mutation, plus the column value
//! domain it carries.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CdcError, Result};

/// Kind of mutation a row underwent at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// A decoded source column value, tagged with its source type so the
/// validator/mapper (C5) can translate it per destination. Collections,
/// tuples, and counters are preserved verbatim; the mapper later decides
/// which destinations can represent them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Decimal(String),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    List(Vec<ColumnValue>),
    Set(Vec<ColumnValue>),
    Map(BTreeMap<String, ColumnValue>),
    Tuple(Vec<ColumnValue>),
    Counter(i64),
}

impl ColumnValue {
    /// A short type tag used by the mapper's source-type lookup table.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ColumnValue::Null => "null",
            ColumnValue::Boolean(_) => "boolean",
            ColumnValue::Int(_) => "int",
            ColumnValue::BigInt(_) => "bigint",
            ColumnValue::Float(_) => "float",
            ColumnValue::Double(_) => "double",
            ColumnValue::Decimal(_) => "decimal",
            ColumnValue::Text(_) => "text",
            ColumnValue::Blob(_) => "blob",
            ColumnValue::Timestamp(_) => "timestamp",
            ColumnValue::Uuid(_) => "uuid",
            ColumnValue::List(_) => "list",
            ColumnValue::Set(_) => "set",
            ColumnValue::Map(_) => "map",
            ColumnValue::Tuple(_) => "tuple",
            ColumnValue::Counter(_) => "counter",
        }
    }

    /// Raw bytes for masking/digesting. Structured values are canonicalized
    /// (sorted by key / lexicographic) before digesting, per the masking
    /// transform's contract.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            ColumnValue::Null => Vec::new(),
            ColumnValue::Boolean(b) => vec![*b as u8],
            ColumnValue::Int(i) => i.to_be_bytes().to_vec(),
            ColumnValue::BigInt(i) => i.to_be_bytes().to_vec(),
            ColumnValue::Float(f) => f.to_be_bytes().to_vec(),
            ColumnValue::Double(f) => f.to_be_bytes().to_vec(),
            ColumnValue::Decimal(s) | ColumnValue::Text(s) => s.as_bytes().to_vec(),
            ColumnValue::Blob(b) => b.clone(),
            ColumnValue::Timestamp(t) => t.timestamp_micros().to_be_bytes().to_vec(),
            ColumnValue::Uuid(u) => u.as_bytes().to_vec(),
            ColumnValue::List(items) | ColumnValue::Set(items) | ColumnValue::Tuple(items) => {
                let mut sorted: Vec<Vec<u8>> = items.iter().map(|v| v.canonical_bytes()).collect();
                sorted.sort();
                sorted.concat()
            }
            ColumnValue::Map(m) => {
                // BTreeMap already iterates in key order.
                let mut out = Vec::new();
                for (k, v) in m {
                    out.extend_from_slice(k.as_bytes());
                    out.extend_from_slice(&v.canonical_bytes());
                }
                out
            }
            ColumnValue::Counter(c) => c.to_be_bytes().to_vec(),
        }
    }
}

/// An ordered column -> value mapping, preserving the declaration order of
/// the key (partition/clustering) tuple.
pub type KeyMap = Vec<(String, ColumnValue)>;
pub type ColumnMap = BTreeMap<String, ColumnValue>;

/// C1 — one row mutation. Immutable once constructed; a masked copy is a
/// new `Event`, never a mutation of an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub keyspace: String,
    pub table: String,
    pub partition_key: KeyMap,
    pub clustering_key: Option<KeyMap>,
    pub columns: ColumnMap,
    /// Microseconds since epoch. Positive; strictly increasing within a
    /// partition for events that are actually committed (§3 invariants).
    pub source_timestamp_micros: i64,
    pub ttl_seconds: Option<i64>,
    pub capture_time: DateTime<Utc>,
}

/// Tolerance for capture-time-in-the-future checks, guarding against clock
/// skew between the reader host and the source.
pub const CAPTURE_SKEW_TOLERANCE: ChronoDuration = ChronoDuration::seconds(5);

impl Event {
    /// Deterministic id derived from `(file, partition key, clustering key,
    /// source timestamp)`, so re-parsing the same bytes always produces the
    /// same event id (parser-determinism contract in §4.1).
    pub fn derive_id(file: &str, partition_key: &KeyMap, clustering_key: &Option<KeyMap>, source_timestamp_micros: i64) -> Uuid {
        let mut buf = Vec::new();
        buf.extend_from_slice(file.as_bytes());
        for (k, v) in partition_key {
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(&v.canonical_bytes());
        }
        if let Some(ck) = clustering_key {
            for (k, v) in ck {
                buf.extend_from_slice(k.as_bytes());
                buf.extend_from_slice(&v.canonical_bytes());
            }
        }
        buf.extend_from_slice(&source_timestamp_micros.to_be_bytes());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, &buf)
    }

    /// Constructs and validates a new event. Enforces: kind-to-columns
    /// coherence, non-empty partition key, positive source timestamp,
    /// capture time not too far in the future.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file: &str,
        kind: EventKind,
        keyspace: String,
        table: String,
        partition_key: KeyMap,
        clustering_key: Option<KeyMap>,
        columns: ColumnMap,
        source_timestamp_micros: i64,
        ttl_seconds: Option<i64>,
        capture_time: DateTime<Utc>,
    ) -> Result<Self> {
        if partition_key.is_empty() {
            return Err(CdcError::Terminal("partition key must be non-empty".into()));
        }
        if source_timestamp_micros <= 0 {
            return Err(CdcError::Terminal("source timestamp must be positive".into()));
        }
        match kind {
            EventKind::Delete => {
                if !columns.is_empty() {
                    return Err(CdcError::Terminal("delete event must carry no column values".into()));
                }
            }
            EventKind::Insert | EventKind::Update => {
                if columns.is_empty() {
                    return Err(CdcError::Terminal(format!("{kind:?} event must carry column values")));
                }
            }
        }
        if let Some(ttl) = ttl_seconds {
            if ttl <= 0 {
                return Err(CdcError::Terminal("ttl must be positive".into()));
            }
        }
        let now = Utc::now();
        if capture_time > now + CAPTURE_SKEW_TOLERANCE {
            return Err(CdcError::Terminal("capture time is too far in the future".into()));
        }

        let id = Self::derive_id(file, &partition_key, &clustering_key, source_timestamp_micros);
        Ok(Event {
            id,
            kind,
            keyspace,
            table,
            partition_key,
            clustering_key,
            columns,
            source_timestamp_micros,
            ttl_seconds,
            capture_time,
        })
    }

    /// The primary key: partition key followed by clustering key, in order.
    pub fn primary_key(&self) -> KeyMap {
        let mut pk = self.partition_key.clone();
        if let Some(ck) = &self.clustering_key {
            pk.extend(ck.clone());
        }
        pk
    }

    /// Returns a copy of this event with `columns` replaced. Used by the
    /// masking transform; the original is discarded by the caller.
    pub fn with_columns(&self, columns: ColumnMap) -> Event {
        Event { columns, ..self.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk() -> KeyMap {
        vec![("user_id".to_string(), ColumnValue::Uuid(Uuid::nil()))]
    }

    #[test]
    fn delete_with_columns_is_rejected() {
        let mut cols = ColumnMap::new();
        cols.insert("age".into(), ColumnValue::Int(1));
        let err = Event::new(
            "log1",
            EventKind::Delete,
            "ks".into(),
            "users".into(),
            pk(),
            None,
            cols,
            1,
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.category(), "Terminal");
    }

    #[test]
    fn empty_partition_key_is_rejected() {
        let err = Event::new(
            "log1",
            EventKind::Insert,
            "ks".into(),
            "users".into(),
            vec![],
            None,
            {
                let mut c = ColumnMap::new();
                c.insert("a".into(), ColumnValue::Int(1));
                c
            },
            1,
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.category(), "Terminal");
    }

    #[test]
    fn same_bytes_produce_same_id() {
        let mut cols = ColumnMap::new();
        cols.insert("age".into(), ColumnValue::Int(30));
        let e1 = Event::new("log1", EventKind::Insert, "ks".into(), "users".into(), pk(), None, cols.clone(), 100, None, Utc::now()).unwrap();
        let e2 = Event::new("log1", EventKind::Insert, "ks".into(), "users".into(), pk(), None, cols, 100, None, Utc::now()).unwrap();
        assert_eq!(e1.id, e2.id);
    }

    #[test]
    fn non_positive_timestamp_rejected() {
        let mut cols = ColumnMap::new();
        cols.insert("a".into(), ColumnValue::Int(1));
        let err = Event::new("log1", EventKind::Insert, "ks".into(), "t".into(), pk(), None, cols, 0, None, Utc::now()).unwrap_err();
        assert_eq!(err.category(), "Terminal");
    }
}
