//! C4 — classifies outgoing columns by name pattern and applies a one-way
//! transform before the event ever reaches a sink.

mod rules;

use hex::encode as hex_encode;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::event::{ColumnMap, ColumnValue, Event};

pub use rules::{default_phi_patterns, default_pii_patterns, MaskingRules};

/// Classification assigned to one outgoing column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Pii,
    Phi,
    None,
}

/// One audit record emitted per masked field. Never carries the original
/// value -- only what strategy was applied and to which key, per §4.4.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MaskingAuditRecord {
    pub event_id: uuid::Uuid,
    pub column_name: String,
    pub classification: &'static str,
    pub strategy: &'static str,
    pub key_id: Option<String>,
}

pub struct MaskingTransform {
    rules: MaskingRules,
    salt: String,
    key_id: String,
}

impl MaskingTransform {
    pub fn new(rules: MaskingRules, salt: impl Into<String>, key_id: impl Into<String>) -> Self {
        MaskingTransform { rules, salt: salt.into(), key_id: key_id.into() }
    }

    /// Classifies a column by its lowercase name. PHI patterns are tested
    /// before PII so that a column matching both receives the stronger
    /// treatment.
    pub fn classify(&self, column_name: &str) -> Classification {
        let lower = column_name.to_lowercase();
        if self.rules.phi_patterns.iter().any(|p| lower.contains(p.as_str())) {
            Classification::Phi
        } else if self.rules.pii_patterns.iter().any(|p| lower.contains(p.as_str())) {
            Classification::Pii
        } else {
            Classification::None
        }
    }

    /// Produces a masked copy of `event` plus the audit trail for every
    /// field that was actually masked. The original event is left
    /// untouched; the caller discards it.
    pub fn apply(&self, event: &Event) -> (Event, Vec<MaskingAuditRecord>) {
        let mut masked = ColumnMap::new();
        let mut audit = Vec::new();

        for (name, value) in &event.columns {
            if matches!(value, ColumnValue::Null) {
                masked.insert(name.clone(), value.clone());
                continue;
            }
            match self.classify(name) {
                Classification::Phi => {
                    let token = self.hmac_token(&value.canonical_bytes());
                    audit.push(MaskingAuditRecord {
                        event_id: event.id,
                        column_name: name.clone(),
                        classification: "PHI",
                        strategy: "HMAC",
                        key_id: Some(self.key_id.clone()),
                    });
                    masked.insert(name.clone(), ColumnValue::Text(token));
                }
                Classification::Pii => {
                    let digest = self.digest(&value.canonical_bytes());
                    audit.push(MaskingAuditRecord {
                        event_id: event.id,
                        column_name: name.clone(),
                        classification: "PII",
                        strategy: "HASH",
                        key_id: None,
                    });
                    masked.insert(name.clone(), ColumnValue::Text(digest));
                }
                Classification::None => {
                    masked.insert(name.clone(), value.clone());
                }
            }
        }
        trace!(event_id = %event.id, masked_fields = audit.len(), "masking applied");
        (event.with_columns(masked), audit)
    }

    fn digest(&self, value: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(value);
        hex_encode(hasher.finalize())
    }

    fn hmac_token(&self, value: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.key_id.as_bytes()).expect("hmac accepts any key length");
        mac.update(value);
        hex_encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnMap, EventKind};
    use chrono::Utc;

    fn sample_event() -> Event {
        let mut cols = ColumnMap::new();
        cols.insert("email".to_string(), ColumnValue::Text("a@b.com".to_string()));
        cols.insert("age".to_string(), ColumnValue::Int(30));
        Event::new(
            "log1",
            EventKind::Insert,
            "ks".into(),
            "users".into(),
            vec![("user_id".to_string(), ColumnValue::Uuid(uuid::Uuid::nil()))],
            None,
            cols,
            1,
            None,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn pii_field_becomes_fixed_length_hex_digest() {
        let rules = MaskingRules::defaults();
        let t = MaskingTransform::new(rules, "salt", "key1");
        let (masked, audit) = t.apply(&sample_event());
        match masked.columns.get("email").unwrap() {
            ColumnValue::Text(s) => assert_eq!(s.len(), 64),
            _ => panic!("expected text"),
        }
        match masked.columns.get("age").unwrap() {
            ColumnValue::Int(30) => {}
            other => panic!("age should pass through unmasked, got {other:?}"),
        }
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].classification, "PII");
        assert_eq!(audit[0].strategy, "HASH");
        assert_eq!(audit[0].column_name, "email");
    }

    #[test]
    fn phi_takes_priority_over_pii_on_ambiguous_names() {
        let mut rules = MaskingRules::defaults();
        rules.pii_patterns.push("identifier".to_string());
        rules.phi_patterns.push("identifier".to_string());
        let t = MaskingTransform::new(rules, "salt", "key1");
        assert_eq!(t.classify("patient_identifier"), Classification::Phi);
    }

    #[test]
    fn masking_is_deterministic() {
        let rules = MaskingRules::defaults();
        let t = MaskingTransform::new(rules, "salt", "key1");
        let (a, _) = t.apply(&sample_event());
        let (b, _) = t.apply(&sample_event());
        assert_eq!(a.columns, b.columns);
    }

    #[test]
    fn nulls_pass_through() {
        let mut cols = ColumnMap::new();
        cols.insert("email".to_string(), ColumnValue::Null);
        let event = Event::new(
            "log1",
            EventKind::Insert,
            "ks".into(),
            "users".into(),
            vec![("user_id".to_string(), ColumnValue::Uuid(uuid::Uuid::nil()))],
            None,
            cols,
            1,
            None,
            Utc::now(),
        )
        .unwrap();
        let t = MaskingTransform::new(MaskingRules::defaults(), "salt", "key1");
        let (masked, audit) = t.apply(&event);
        assert_eq!(masked.columns.get("email").unwrap(), &ColumnValue::Null);
        assert!(audit.is_empty());
    }
}
