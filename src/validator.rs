//! C5 (validator half) — rejects events the current schema or destination
//! mapper cannot faithfully represent, per §4.5.

use crate::error::CdcError;
use crate::event::Event;
use crate::mapper::{MappedType, SchemaMapper};
use crate::schema::SchemaSnapshot;

pub struct Validator<'a> {
    mapper: &'a SchemaMapper,
}

impl<'a> Validator<'a> {
    pub fn new(mapper: &'a SchemaMapper) -> Self {
        Validator { mapper }
    }

    /// Validates `event` against `schema`, the cached snapshot for its
    /// `(keyspace, table)` (`None` if the schema monitor has not observed
    /// this table yet — the add-column race in §4.5).
    pub fn validate(&self, event: &Event, schema: Option<&SchemaSnapshot>) -> Result<(), CdcError> {
        for (name, value) in &event.columns {
            let source_type = value.type_tag();
            if matches!(self.mapper.map_type(source_type), MappedType::Unsupported) {
                return Err(CdcError::SchemaIncompatible {
                    column: name.clone(),
                    reason: format!("source type {source_type} has no destination mapping"),
                });
            }

            // A column absent from the cached schema is either a genuine
            // add-column race (accept; DDL is applied before the next
            // batch per §4.9) or simply not yet observed -- either way
            // there is nothing further to check against a definition that
            // does not exist yet.
            let Some(schema) = schema else { continue };
            let Some(_col) = schema.column(name) else { continue };
        }

        if let Some(schema) = schema {
            for (pk_name, _) in &event.partition_key {
                if schema.column(pk_name).is_none() {
                    // The column was dropped from the schema but this event
                    // still carries it as part of its partition key.
                    return Err(CdcError::SchemaIncompatible {
                        column: pk_name.clone(),
                        reason: "partition key column was dropped from the destination schema".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
