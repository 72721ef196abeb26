//! Diffs two `SchemaSnapshot`s into an ordered `SchemaChange`, per §4.2:
//! drops first, then adds, then alter-type, stable order by column name
//! within each group.

use super::snapshot::{ColumnDef, ColumnOp, Compatibility, SchemaChange, SchemaSnapshot};

/// Source-type widening pairs the mapper treats as a compatible alter.
/// Shared with the validator/mapper (C5) so "compatible" means the same
/// thing in both places.
const WIDENING_PAIRS: &[(&str, &str)] = &[
    ("int", "bigint"),
    ("decimal", "double"),
    ("float", "double"),
    ("text", "blob"),
];

pub fn is_widening(old_type: &str, new_type: &str) -> bool {
    old_type == new_type || WIDENING_PAIRS.iter().any(|(o, n)| *o == old_type && *n == new_type)
}

/// Diffs `old` against `new`, both describing the same `(keyspace, table)`.
/// Returns `None` if there is no change.
pub fn diff(old: &SchemaSnapshot, new_columns: &[ColumnDef]) -> Option<SchemaChange> {
    let mut drops: Vec<ColumnOp> = Vec::new();
    let mut adds: Vec<ColumnOp> = Vec::new();
    let mut alters: Vec<ColumnOp> = Vec::new();

    for old_col in &old.columns {
        if !new_columns.iter().any(|c| c.name == old_col.name) {
            let compatibility = if old_col.is_partition_key || old_col.is_clustering_key {
                Compatibility::Incompatible
            } else {
                Compatibility::Compatible
            };
            drops.push(ColumnOp::Drop { column: old_col.clone(), compatibility });
        }
    }
    for new_col in new_columns {
        if !old.columns.iter().any(|c| c.name == new_col.name) {
            adds.push(ColumnOp::Add { column: new_col.clone(), compatibility: Compatibility::Compatible });
        }
    }
    for new_col in new_columns {
        if let Some(old_col) = old.columns.iter().find(|c| c.name == new_col.name) {
            if old_col.source_type != new_col.source_type {
                let compatibility =
                    if is_widening(&old_col.source_type, &new_col.source_type) { Compatibility::Compatible } else { Compatibility::Incompatible };
                alters.push(ColumnOp::AlterType {
                    name: new_col.name.clone(),
                    old_type: old_col.source_type.clone(),
                    new_type: new_col.source_type.clone(),
                    compatibility,
                });
            }
        }
    }

    drops.sort_by(|a, b| op_name(a).cmp(op_name(b)));
    adds.sort_by(|a, b| op_name(a).cmp(op_name(b)));
    alters.sort_by(|a, b| op_name(a).cmp(op_name(b)));

    let mut ops = Vec::new();
    ops.extend(drops);
    ops.extend(adds);
    ops.extend(alters);

    if ops.is_empty() {
        return None;
    }
    Some(SchemaChange { keyspace: old.keyspace.clone(), table: old.table.clone(), from_version: old.version, to_version: old.version + 1, ops })
}

fn op_name(op: &ColumnOp) -> &str {
    match op {
        ColumnOp::Add { column, .. } => &column.name,
        ColumnOp::Drop { column, .. } => &column.name,
        ColumnOp::AlterType { name, .. } => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, ty: &str) -> ColumnDef {
        ColumnDef { name: name.to_string(), source_type: ty.to_string(), is_partition_key: name == "user_id", is_clustering_key: false, is_static: false }
    }

    #[test]
    fn add_column_is_compatible() {
        let old = SchemaSnapshot::new("ks", "users", vec![col("user_id", "uuid"), col("email", "text")]);
        let new = vec![col("user_id", "uuid"), col("email", "text"), col("city", "text")];
        let change = diff(&old, &new).unwrap();
        assert_eq!(change.ops.len(), 1);
        assert!(matches!(&change.ops[0], ColumnOp::Add { compatibility: Compatibility::Compatible, .. }));
        assert!(!change.is_incompatible());
    }

    #[test]
    fn dropping_partition_key_is_incompatible() {
        let old = SchemaSnapshot::new("ks", "users", vec![col("user_id", "uuid"), col("email", "text")]);
        let new = vec![col("email", "text")];
        let change = diff(&old, &new).unwrap();
        assert!(change.is_incompatible());
    }

    #[test]
    fn widening_alter_is_compatible_narrowing_is_not() {
        let old = SchemaSnapshot::new("ks", "users", vec![col("user_id", "uuid"), col("age", "int")]);
        let widened = vec![col("user_id", "uuid"), col("age", "bigint")];
        let change = diff(&old, &widened).unwrap();
        assert!(!change.is_incompatible());

        let narrowed = vec![col("user_id", "uuid"), col("age", "text")];
        let narrow_change = diff(&old, &narrowed).unwrap();
        assert!(narrow_change.is_incompatible());
    }

    #[test]
    fn ordering_is_drops_then_adds_then_alters() {
        let old = SchemaSnapshot::new("ks", "t", vec![col("user_id", "uuid"), col("z_col", "text"), col("age", "int")]);
        let new = vec![col("user_id", "uuid"), col("age", "bigint"), col("new_col", "text")];
        let change = diff(&old, &new).unwrap();
        assert!(matches!(change.ops[0], ColumnOp::Drop { .. }));
        assert!(matches!(change.ops[1], ColumnOp::Add { .. }));
        assert!(matches!(change.ops[2], ColumnOp::AlterType { .. }));
    }
}
