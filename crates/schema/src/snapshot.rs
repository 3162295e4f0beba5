use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;
use sha2::{
    Digest,
    Sha256,
};
use sql::SqlValue;

use crate::{
    column::{
        AppType,
        ColumnMeta,
        InsertType,
        StorageType,
    },
    table::{
        ConstraintMeta,
        IndexMeta,
        Schema,
        TableMeta,
    },
};

/// Serializable description of one column: purely data, no capability slots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    pub name: String,
    pub db_name: String,
    pub storage_type: StorageType,
    pub app_type: AppType,
    pub insert_type: InsertType,
    pub not_null: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub foreign_key: Option<String>,
    pub generated_always_as: Option<String>,
    pub default: Option<SqlValue>,
    pub enum_values: Vec<String>,
    pub renamed_from: Option<String>,
}

impl From<&ColumnMeta> for ColumnSnapshot {
    fn from(column: &ColumnMeta) -> Self {
        Self {
            name: column.name.clone(),
            db_name: column.db_name.clone(),
            storage_type: column.storage_type,
            app_type: column.app_type,
            insert_type: column.insert_type,
            not_null: column.not_null,
            primary_key: column.primary_key,
            unique: column.unique,
            foreign_key: column.foreign_key.clone(),
            generated_always_as: column.generated_always_as.clone(),
            default: column.default.clone(),
            enum_values: column.enum_values.clone(),
            renamed_from: column.renamed_from.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub name: String,
    pub db_name: String,
    pub columns: Vec<ColumnSnapshot>,
    pub indexes: Vec<IndexMeta>,
    pub constraints: Vec<ConstraintMeta>,
    pub renamed_from: Option<String>,
}

impl From<&TableMeta> for TableSnapshot {
    fn from(table: &TableMeta) -> Self {
        Self {
            name: table.name.clone(),
            db_name: table.db_name.clone(),
            columns: table.columns.iter().map(ColumnSnapshot::from).collect(),
            indexes: table.indexes.clone(),
            constraints: table.constraints.clone(),
            renamed_from: table.renamed_from.clone(),
        }
    }
}

impl TableSnapshot {
    pub fn column_by_db_name(&self, db_name: &str) -> Option<&ColumnSnapshot> {
        self.columns.iter().find(|c| c.db_name == db_name)
    }
}

/// The authoritative comparison unit for migrations: an ordered list of
/// table descriptors. Hashing goes through a canonical key-sorted JSON
/// rendering so equal snapshots hash equally regardless of construction
/// order inside objects.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSnapshot>,
}

impl SchemaSnapshot {
    pub fn of(schema: &Schema) -> Self {
        Self {
            tables: schema
                .tables()
                .iter()
                // Aliases are join-time derivations, not storage.
                .filter(|t| t.aliased_from.is_none())
                .map(|t| TableSnapshot::from(t.as_ref()))
                .collect(),
        }
    }

    pub fn table_by_db_name(&self, db_name: &str) -> Option<&TableSnapshot> {
        self.tables.iter().find(|t| t.db_name == db_name)
    }

    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self).expect("snapshot serializes");
        canonical_string(&value)
    }

    /// 128-bit content address: hex of the first 16 bytes of the SHA-256 of
    /// the canonical JSON.
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.canonical_json().as_bytes());
        digest[..16].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Deterministic JSON rendering: object keys sorted, arrays in order, no
/// whitespace.
pub fn canonical_string(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        },
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        other => out.push_str(&other.to_string()),
    }
}
