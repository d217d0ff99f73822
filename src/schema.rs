use rusqlite::Connection;

use crate::{
    errors::SensorGraphError,
    registry::{EntityType, Relation},
};

/// Bumped whenever the table layout below changes.
pub const SCHEMA_VERSION: i64 = 1;

/// Creates one table per entity type plus the retired-identifier ledger.
///
/// Each type table holds the row version, the JSON-encoded properties and one nullable link
/// column per to-one relation; to-many relations are answered through the index on the
/// child's link column.
pub fn ensure_schema(conn: &Connection) -> Result<(), SensorGraphError> {
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| SensorGraphError::schema(e.to_string()))?;
    if version > SCHEMA_VERSION {
        return Err(SensorGraphError::schema(format!(
            "store schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    conn.execute_batch(&schema_sql())
        .map_err(|e| SensorGraphError::schema(e.to_string()))?;
    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| SensorGraphError::schema(e.to_string()))?;
    }
    Ok(())
}

pub fn schema_sql() -> String {
    let mut sql = String::new();
    for entity_type in EntityType::ALL {
        let table = entity_type.table();
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    id         TEXT PRIMARY KEY NOT NULL,\n    version    INTEGER NOT NULL,\n    properties TEXT NOT NULL"
        ));
        for column in link_columns(entity_type) {
            sql.push_str(&format!(",\n    {column} TEXT"));
        }
        sql.push_str("\n);\n");
        for column in link_columns(entity_type) {
            sql.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table}({column}, id);\n"
            ));
        }
    }
    sql.push_str(
        r#"CREATE TABLE IF NOT EXISTS retired_ids (
    entity_type TEXT NOT NULL,
    id          TEXT NOT NULL,
    PRIMARY KEY (entity_type, id)
);
"#,
    );
    sql
}

/// Link columns of `entity_type`, in schema order.
pub fn link_columns(entity_type: EntityType) -> impl Iterator<Item = &'static str> {
    entity_type
        .schema()
        .to_one()
        .filter_map(|relation: &'static Relation| relation.column)
}

/// `SELECT` column list matching [`crate::backend`]'s row decoding order.
pub fn select_columns(entity_type: EntityType) -> String {
    let mut columns = vec!["id", "version", "properties"];
    columns.extend(link_columns(entity_type));
    columns.join(", ")
}
