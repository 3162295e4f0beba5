use std::sync::Arc;

use anyhow::{
    bail,
    Context,
};
use chrono::{
    DateTime,
    SecondsFormat,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;
use sql::SqlValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Integer,
    Real,
    Text,
    Blob,
}

impl StorageType {
    pub fn as_sql(self) -> &'static str {
        match self {
            StorageType::Integer => "INTEGER",
            StorageType::Real => "REAL",
            StorageType::Text => "TEXT",
            StorageType::Blob => "BLOB",
        }
    }
}

/// The application-level interpretation layered on top of the storage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    None,
    Json,
    Date,
    Boolean,
    Enum,
    Ulid,
}

/// Governs whether the column must be supplied on insert. `Virtual` columns
/// are generated and never written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertType {
    Required,
    Optional,
    WithDefault,
    Virtual,
}

/// app value -> storage value
pub type EncodeFn = Arc<dyn Fn(&JsonValue) -> anyhow::Result<SqlValue> + Send + Sync>;
/// storage value -> app value
pub type DecodeFn = Arc<dyn Fn(&SqlValue) -> anyhow::Result<JsonValue> + Send + Sync>;
/// zero-arg producer for application defaults and on-update values
pub type ProduceFn = Arc<dyn Fn() -> JsonValue + Send + Sync>;

/// Metadata of one column: a data record plus capability slots for the
/// polymorphic bits (encode/decode/default producers).
#[derive(Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub db_name: String,
    pub storage_type: StorageType,
    pub app_type: AppType,
    pub insert_type: InsertType,
    pub not_null: bool,
    pub primary_key: bool,
    pub unique: bool,
    /// `"table.column"`
    pub foreign_key: Option<String>,
    pub generated_always_as: Option<String>,
    pub default: Option<SqlValue>,
    pub app_default: Option<ProduceFn>,
    pub app_on_update: Option<ProduceFn>,
    pub encode: Option<EncodeFn>,
    pub decode: Option<DecodeFn>,
    pub enum_values: Vec<String>,
    pub renamed_from: Option<String>,
    pub json_schema: Option<String>,
}

impl std::fmt::Debug for ColumnMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnMeta")
            .field("name", &self.name)
            .field("db_name", &self.db_name)
            .field("storage_type", &self.storage_type)
            .field("app_type", &self.app_type)
            .field("insert_type", &self.insert_type)
            .finish_non_exhaustive()
    }
}

impl ColumnMeta {
    pub fn is_virtual(&self) -> bool {
        self.insert_type == InsertType::Virtual
    }

    /// Encodes an application value to its storage form. A custom `encode`
    /// wins; otherwise the app type dictates the conversion. Nulls pass
    /// through untouched.
    pub fn encode_value(&self, value: &JsonValue) -> anyhow::Result<SqlValue> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        if let Some(encode) = &self.encode {
            return encode(value);
        }
        match self.app_type {
            AppType::Json => Ok(SqlValue::Text(serde_json::to_string(value)?)),
            AppType::Date => {
                let text = value
                    .as_str()
                    .with_context(|| format!("column {} expects an RFC 3339 date", self.name))?;
                let parsed = DateTime::parse_from_rfc3339(text)
                    .with_context(|| format!("column {}: invalid date {text:?}", self.name))?;
                Ok(SqlValue::Integer(parsed.timestamp_millis()))
            },
            AppType::Boolean => {
                let b = value
                    .as_bool()
                    .with_context(|| format!("column {} expects a boolean", self.name))?;
                Ok(SqlValue::Integer(b as i64))
            },
            AppType::Enum => {
                let text = value
                    .as_str()
                    .with_context(|| format!("column {} expects an enum string", self.name))?;
                if !self.enum_values.iter().any(|v| v == text) {
                    bail!(
                        "column {}: {text:?} is not one of {:?}",
                        self.name,
                        self.enum_values
                    );
                }
                Ok(SqlValue::Text(text.to_owned()))
            },
            AppType::Ulid => {
                let text = value
                    .as_str()
                    .with_context(|| format!("column {} expects a ULID string", self.name))?;
                Ok(SqlValue::Text(text.to_owned()))
            },
            AppType::None => self.coerce_plain(value),
        }
    }

    fn coerce_plain(&self, value: &JsonValue) -> anyhow::Result<SqlValue> {
        let out = match self.storage_type {
            StorageType::Integer => match value {
                JsonValue::Number(n) if n.as_i64().is_some() => {
                    SqlValue::Integer(n.as_i64().expect("checked"))
                },
                JsonValue::Bool(b) => SqlValue::Integer(*b as i64),
                _ => bail!("column {}: expected an integer, got {value}", self.name),
            },
            StorageType::Real => match value.as_f64() {
                Some(f) => SqlValue::Real(f),
                None => bail!("column {}: expected a number, got {value}", self.name),
            },
            StorageType::Text => match value.as_str() {
                Some(s) => SqlValue::Text(s.to_owned()),
                None => bail!("column {}: expected a string, got {value}", self.name),
            },
            StorageType::Blob => match value.as_str() {
                Some(s) => SqlValue::Blob(
                    base64::decode(s)
                        .with_context(|| format!("column {}: invalid base64 blob", self.name))?,
                ),
                None => bail!("column {}: expected a base64 string, got {value}", self.name),
            },
        };
        Ok(out)
    }

    /// Decodes a storage value back to its application form. Null and absent
    /// values are left untouched by callers.
    pub fn decode_value(&self, value: &SqlValue) -> anyhow::Result<JsonValue> {
        if value.is_null() {
            return Ok(JsonValue::Null);
        }
        if let Some(decode) = &self.decode {
            return decode(value);
        }
        match self.app_type {
            AppType::Json => match value {
                SqlValue::Text(text) => Ok(serde_json::from_str(text)
                    .with_context(|| format!("column {}: stored JSON is invalid", self.name))?),
                other => bail!("column {}: expected stored text, got {}", self.name, other.type_name()),
            },
            AppType::Date => match value {
                SqlValue::Integer(ms) => {
                    let date: DateTime<Utc> = DateTime::from_timestamp_millis(*ms)
                        .with_context(|| format!("column {}: timestamp out of range", self.name))?;
                    // Fixed millisecond precision, so stored values render
                    // identically on every decode.
                    Ok(JsonValue::String(
                        date.to_rfc3339_opts(SecondsFormat::Millis, false),
                    ))
                },
                other => bail!("column {}: expected stored integer, got {}", self.name, other.type_name()),
            },
            AppType::Boolean => match value {
                SqlValue::Integer(i) => Ok(JsonValue::Bool(*i != 0)),
                other => bail!("column {}: expected stored integer, got {}", self.name, other.type_name()),
            },
            _ => Ok(value.to_json()),
        }
    }

    /// The application default for a missing optional column, if configured.
    pub fn produce_default(&self) -> Option<JsonValue> {
        self.app_default.as_ref().map(|f| f())
    }
}

/// Chainable column builder; terminalized by [`crate::table::table`], which
/// supplies the application name.
#[derive(Clone)]
pub struct ColumnBuilder {
    storage_type: StorageType,
    app_type: AppType,
    insert_type: InsertType,
    not_null: bool,
    primary_key: bool,
    unique: bool,
    foreign_key: Option<String>,
    generated_always_as: Option<String>,
    default: Option<SqlValue>,
    app_default: Option<ProduceFn>,
    app_on_update: Option<ProduceFn>,
    encode: Option<EncodeFn>,
    decode: Option<DecodeFn>,
    enum_values: Vec<String>,
    renamed_from: Option<String>,
    json_schema: Option<String>,
}

fn builder(storage_type: StorageType, app_type: AppType) -> ColumnBuilder {
    ColumnBuilder {
        storage_type,
        app_type,
        insert_type: InsertType::Required,
        not_null: false,
        primary_key: false,
        unique: false,
        foreign_key: None,
        generated_always_as: None,
        default: None,
        app_default: None,
        app_on_update: None,
        encode: None,
        decode: None,
        enum_values: Vec::new(),
        renamed_from: None,
        json_schema: None,
    }
}

/// Text-stored ULID primary key with a fresh-ULID default.
pub fn id() -> ColumnBuilder {
    builder(StorageType::Text, AppType::Ulid)
        .primary_key()
        .not_null()
        .default_fn(|| JsonValue::String(ulid::Ulid::new().to_string()))
}

pub fn text() -> ColumnBuilder {
    builder(StorageType::Text, AppType::None)
}

pub fn integer() -> ColumnBuilder {
    builder(StorageType::Integer, AppType::None)
}

pub fn real() -> ColumnBuilder {
    builder(StorageType::Real, AppType::None)
}

pub fn blob() -> ColumnBuilder {
    builder(StorageType::Blob, AppType::None)
}

pub fn date() -> ColumnBuilder {
    builder(StorageType::Integer, AppType::Date)
}

pub fn boolean() -> ColumnBuilder {
    builder(StorageType::Integer, AppType::Boolean)
}

pub fn json() -> ColumnBuilder {
    builder(StorageType::Text, AppType::Json)
}

pub fn enumeration(values: impl IntoIterator<Item = impl Into<String>>) -> ColumnBuilder {
    let mut b = builder(StorageType::Text, AppType::Enum);
    b.enum_values = values.into_iter().map(Into::into).collect();
    b
}

impl ColumnBuilder {
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// `"table.column"`
    pub fn references(mut self, target: impl Into<String>) -> Self {
        self.foreign_key = Some(target.into());
        self
    }

    /// A storage-level DEFAULT literal; the column becomes optional on
    /// insert.
    pub fn default_(mut self, value: impl Into<SqlValue>) -> Self {
        self.default = Some(value.into());
        self.insert_type = InsertType::WithDefault;
        self
    }

    /// An application-level default produced at insert time.
    pub fn default_fn(
        mut self,
        f: impl Fn() -> JsonValue + Send + Sync + 'static,
    ) -> Self {
        self.app_default = Some(Arc::new(f));
        self.insert_type = InsertType::WithDefault;
        self
    }

    /// Installs the conventional per-type application default: `""` for
    /// text, `0` for numerics, `false` for boolean, now for date, `{}` for
    /// json, the first value for enums.
    pub fn default_auto(self) -> Self {
        let produced: ProduceFn = match (self.app_type, self.storage_type) {
            (AppType::Boolean, _) => Arc::new(|| JsonValue::Bool(false)),
            (AppType::Date, _) => Arc::new(|| {
                JsonValue::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, false))
            }),
            (AppType::Json, _) => Arc::new(|| JsonValue::Object(Default::default())),
            (AppType::Ulid, _) => Arc::new(|| JsonValue::String(ulid::Ulid::new().to_string())),
            (AppType::Enum, _) => {
                let first = self.enum_values.first().cloned().unwrap_or_default();
                Arc::new(move || JsonValue::String(first.clone()))
            },
            (AppType::None, StorageType::Text) => Arc::new(|| JsonValue::String(String::new())),
            (AppType::None, StorageType::Real) => Arc::new(|| JsonValue::from(0.0)),
            (AppType::None, _) => Arc::new(|| JsonValue::from(0)),
        };
        let mut this = self;
        this.app_default = Some(produced);
        this.insert_type = InsertType::WithDefault;
        this
    }

    /// Producer invoked on every UPDATE, overwriting the column.
    pub fn on_update_fn(
        mut self,
        f: impl Fn() -> JsonValue + Send + Sync + 'static,
    ) -> Self {
        self.app_on_update = Some(Arc::new(f));
        self
    }

    pub fn generated_always_as(mut self, expr: impl Into<String>) -> Self {
        self.generated_always_as = Some(expr.into());
        self.insert_type = InsertType::Virtual;
        self
    }

    pub fn renamed_from(mut self, previous_db_name: impl Into<String>) -> Self {
        self.renamed_from = Some(previous_db_name.into());
        self
    }

    pub fn encode(
        mut self,
        f: impl Fn(&JsonValue) -> anyhow::Result<SqlValue> + Send + Sync + 'static,
    ) -> Self {
        self.encode = Some(Arc::new(f));
        self
    }

    pub fn decode(
        mut self,
        f: impl Fn(&SqlValue) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    ) -> Self {
        self.decode = Some(Arc::new(f));
        self
    }

    pub fn optional(mut self) -> Self {
        self.insert_type = InsertType::Optional;
        self
    }

    pub fn json_schema(mut self, reference: impl Into<String>) -> Self {
        self.json_schema = Some(reference.into());
        self
    }

    pub(crate) fn build(self, app_name: &str) -> ColumnMeta {
        ColumnMeta {
            name: app_name.to_owned(),
            db_name: snake_case(app_name),
            storage_type: self.storage_type,
            app_type: self.app_type,
            insert_type: self.insert_type,
            not_null: self.not_null,
            primary_key: self.primary_key,
            unique: self.unique,
            foreign_key: self.foreign_key,
            generated_always_as: self.generated_always_as,
            default: self.default,
            app_default: self.app_default,
            app_on_update: self.app_on_update,
            encode: self.encode,
            decode: self.decode,
            enum_values: self.enum_values,
            renamed_from: self.renamed_from,
            json_schema: self.json_schema,
        }
    }
}

/// `fullName` -> `full_name`
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
