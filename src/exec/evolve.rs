use datafusion::arrow::datatypes::{DataType, SchemaRef, TimeUnit};
use tracing::warn;

use crate::engine::SqlEngine;
use crate::errors::Result;

/// Map an Arrow type to the SQL type name used in generated `CAST`s.
/// `None` means the type has no useful SQL spelling here; such columns are
/// carried as-is and never widened.
fn sql_type(data_type: &DataType) -> Option<&'static str> {
    match data_type {
        DataType::Boolean => Some("BOOLEAN"),
        DataType::Int8 | DataType::Int16 => Some("SMALLINT"),
        DataType::Int32 => Some("INTEGER"),
        DataType::Int64 => Some("BIGINT"),
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 => Some("INTEGER"),
        DataType::UInt64 => Some("BIGINT"),
        DataType::Float32 => Some("FLOAT"),
        DataType::Float64 => Some("DOUBLE"),
        DataType::Utf8 | DataType::LargeUtf8 => Some("VARCHAR"),
        DataType::Date32 | DataType::Date64 => Some("DATE"),
        DataType::Timestamp(TimeUnit::Second, _)
        | DataType::Timestamp(TimeUnit::Millisecond, _)
        | DataType::Timestamp(TimeUnit::Microsecond, _)
        | DataType::Timestamp(TimeUnit::Nanosecond, _) => Some("TIMESTAMP"),
        _ => None,
    }
}

fn numeric_rank(data_type: &DataType) -> Option<u8> {
    match data_type {
        DataType::Int8 | DataType::UInt8 => Some(1),
        DataType::Int16 | DataType::UInt16 => Some(2),
        DataType::Int32 | DataType::UInt32 => Some(3),
        DataType::Int64 | DataType::UInt64 => Some(4),
        DataType::Float32 => Some(5),
        DataType::Float64 => Some(6),
        _ => None,
    }
}

/// Whether replacing a target column of `target` type with `incoming` is a
/// widening numeric change (always safe to apply).
fn is_widening(target: &DataType, incoming: &DataType) -> bool {
    match (numeric_rank(target), numeric_rank(incoming)) {
        (Some(t), Some(i)) => i > t,
        _ => false,
    }
}

/// A planned change to the target table's schema.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    /// New column from the incoming relation, added as nullable.
    AddColumn { name: String, data_type: DataType },
    /// Numeric widening of an existing column.
    Widen { name: String, to: DataType },
}

/// Diff the incoming relation against the target table.
///
/// Additive changes (new columns, numeric widening) are returned as changes
/// to apply. Narrowing or incompatible changes produce a `tracing` warning
/// and leave the target type untouched; the insert projection casts the
/// incoming column instead, so nothing is silently lost.
pub fn diff_schemas(target: &SchemaRef, incoming: &SchemaRef, table: &str) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    for field in incoming.fields() {
        match target.field_with_name(field.name()) {
            Err(_) => changes.push(SchemaChange::AddColumn {
                name: field.name().clone(),
                data_type: field.data_type().clone(),
            }),
            Ok(existing) if existing.data_type() == field.data_type() => {}
            Ok(existing) if is_widening(existing.data_type(), field.data_type()) => {
                changes.push(SchemaChange::Widen {
                    name: field.name().clone(),
                    to: field.data_type().clone(),
                });
            }
            Ok(existing) => {
                warn!(
                    table,
                    column = %field.name(),
                    target_type = ?existing.data_type(),
                    incoming_type = ?field.data_type(),
                    "incompatible column type change; keeping existing type"
                );
            }
        }
    }
    changes
}

/// Apply schema changes to `target` by rebuilding it through a swap table.
/// No-op when `changes` is empty.
pub async fn apply_changes(
    engine: &dyn SqlEngine,
    target: &str,
    target_schema: &SchemaRef,
    changes: &[SchemaChange],
) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }

    let mut projection: Vec<String> = Vec::new();
    for field in target_schema.fields() {
        let widen_to = changes.iter().find_map(|c| match c {
            SchemaChange::Widen { name, to } if name == field.name() => Some(to),
            _ => None,
        });
        match widen_to.and_then(sql_type) {
            Some(ty) => projection.push(format!("CAST({name} AS {ty}) AS {name}", name = field.name())),
            None => projection.push(field.name().clone()),
        }
    }
    for change in changes {
        if let SchemaChange::AddColumn { name, data_type } = change {
            let ty = sql_type(data_type).unwrap_or("VARCHAR");
            projection.push(format!("CAST(NULL AS {ty}) AS {name}"));
        }
    }

    let swap = format!("__sqlflow_evolve_{target}");
    engine
        .execute(
            &format!(
                "CREATE OR REPLACE TABLE {swap} AS SELECT {} FROM {target}",
                projection.join(", ")
            ),
            Vec::new(),
        )
        .await?;
    engine
        .execute(
            &format!("CREATE OR REPLACE TABLE {target} AS SELECT * FROM {swap}"),
            Vec::new(),
        )
        .await?;
    engine.drop_table(&swap).await?;
    Ok(())
}

/// Evolve `target` so it can absorb rows shaped like `incoming`, returning
/// the refreshed target schema.
pub async fn evolve_target(
    engine: &dyn SqlEngine,
    target: &str,
    incoming: &SchemaRef,
) -> Result<SchemaRef> {
    let target_schema = engine.table_schema(target).await?;
    let changes = diff_schemas(&target_schema, incoming, target);
    apply_changes(engine, target, &target_schema, &changes).await?;
    engine.table_schema(target).await
}

/// Build a SELECT list over `source_rel` aligned to the target's columns:
/// matching columns pass through (cast when types differ and both sides have
/// SQL spellings), columns missing from the source become typed NULLs.
pub fn aligned_projection(target: &SchemaRef, source: &SchemaRef, source_rel: &str) -> String {
    let mut items = Vec::with_capacity(target.fields().len());
    for field in target.fields() {
        let name = field.name();
        match source.field_with_name(name) {
            Ok(src_field) if src_field.data_type() == field.data_type() => {
                items.push(format!("{source_rel}.{name}"));
            }
            Ok(_) => match sql_type(field.data_type()) {
                Some(ty) => items.push(format!("CAST({source_rel}.{name} AS {ty}) AS {name}")),
                None => items.push(format!("{source_rel}.{name}")),
            },
            Err(_) => {
                let ty = sql_type(field.data_type()).unwrap_or("VARCHAR");
                items.push(format!("CAST(NULL AS {ty}) AS {name}"));
            }
        }
    }
    items.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn schema(fields: Vec<(&str, DataType)>) -> SchemaRef {
        Arc::new(Schema::new(
            fields
                .into_iter()
                .map(|(n, t)| Field::new(n, t, true))
                .collect::<Vec<_>>(),
        ))
    }

    #[test]
    fn detects_added_columns_and_widening() {
        let target = schema(vec![("id", DataType::Int32), ("v", DataType::Int64)]);
        let incoming = schema(vec![
            ("id", DataType::Int64),
            ("v", DataType::Int64),
            ("extra", DataType::Utf8),
        ]);
        let changes = diff_schemas(&target, &incoming, "t");
        assert_eq!(
            changes,
            vec![
                SchemaChange::Widen {
                    name: "id".into(),
                    to: DataType::Int64
                },
                SchemaChange::AddColumn {
                    name: "extra".into(),
                    data_type: DataType::Utf8
                },
            ]
        );
    }

    #[test]
    fn narrowing_is_not_a_change() {
        let target = schema(vec![("v", DataType::Float64)]);
        let incoming = schema(vec![("v", DataType::Int32)]);
        assert!(diff_schemas(&target, &incoming, "t").is_empty());
    }

    #[test]
    fn aligned_projection_fills_missing_with_typed_nulls() {
        let target = schema(vec![("id", DataType::Int64), ("gone", DataType::Utf8)]);
        let source = schema(vec![("id", DataType::Int64)]);
        let projection = aligned_projection(&target, &source, "s");
        assert_eq!(projection, "s.id, CAST(NULL AS VARCHAR) AS gone");
    }
}
