//! Columnar encoding of row batches for the pull stream: one Arrow IPC
//! stream per binary frame, columns in table order, storage types mapped
//! Integer/Real/Text/Blob to Int64/Float64/Utf8/Binary, all nullable.

use std::{
    io::Cursor,
    sync::Arc,
};

use anyhow::{
    bail,
    Context,
};
use arrow::{
    array::{
        Array,
        ArrayRef,
        BinaryArray,
        Float64Array,
        Int64Array,
        StringArray,
    },
    datatypes::{
        DataType,
        Field,
        Schema as ArrowSchema,
    },
    ipc::{
        reader::StreamReader,
        writer::StreamWriter,
    },
    record_batch::RecordBatch,
};
use schema::StorageType;
use sql::{
    row_get,
    SqlRow,
    SqlValue,
};

fn arrow_type(storage: StorageType) -> DataType {
    match storage {
        StorageType::Integer => DataType::Int64,
        StorageType::Real => DataType::Float64,
        StorageType::Text => DataType::Utf8,
        StorageType::Blob => DataType::Binary,
    }
}

pub fn encode_rows(
    columns: &[(String, StorageType)],
    rows: &[SqlRow],
) -> anyhow::Result<Vec<u8>> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, storage)| Field::new(name, arrow_type(*storage), true))
        .collect();
    let arrow_schema = Arc::new(ArrowSchema::new(fields));

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (name, storage) in columns {
        let array: ArrayRef = match storage {
            StorageType::Integer => Arc::new(
                rows.iter()
                    .map(|row| match row_get(row, name) {
                        Some(SqlValue::Integer(i)) => Ok(Some(*i)),
                        Some(SqlValue::Null) | None => Ok(None),
                        Some(other) => {
                            bail!("column {name}: expected integer, got {}", other.type_name())
                        },
                    })
                    .collect::<anyhow::Result<Int64Array>>()?,
            ),
            StorageType::Real => Arc::new(
                rows.iter()
                    .map(|row| match row_get(row, name) {
                        Some(SqlValue::Real(f)) => Ok(Some(*f)),
                        Some(SqlValue::Integer(i)) => Ok(Some(*i as f64)),
                        Some(SqlValue::Null) | None => Ok(None),
                        Some(other) => {
                            bail!("column {name}: expected real, got {}", other.type_name())
                        },
                    })
                    .collect::<anyhow::Result<Float64Array>>()?,
            ),
            StorageType::Text => Arc::new(
                rows.iter()
                    .map(|row| match row_get(row, name) {
                        Some(SqlValue::Text(s)) => Ok(Some(s.clone())),
                        Some(SqlValue::Null) | None => Ok(None),
                        Some(other) => {
                            bail!("column {name}: expected text, got {}", other.type_name())
                        },
                    })
                    .collect::<anyhow::Result<StringArray>>()?,
            ),
            StorageType::Blob => Arc::new(
                rows.iter()
                    .map(|row| match row_get(row, name) {
                        Some(SqlValue::Blob(b)) => Ok(Some(b.clone())),
                        Some(SqlValue::Null) | None => Ok(None),
                        Some(other) => {
                            bail!("column {name}: expected blob, got {}", other.type_name())
                        },
                    })
                    .collect::<anyhow::Result<BinaryArray>>()?,
            ),
        };
        arrays.push(array);
    }

    let batch = RecordBatch::try_new(arrow_schema.clone(), arrays)?;
    let mut buffer = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buffer, &arrow_schema)?;
        writer.write(&batch)?;
        writer.finish()?;
    }
    Ok(buffer)
}

pub fn decode_rows(bytes: &[u8]) -> anyhow::Result<(Vec<String>, Vec<SqlRow>)> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    let arrow_schema = reader.schema();
    let names: Vec<String> = arrow_schema
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        for i in 0..batch.num_rows() {
            let mut row = SqlRow::with_capacity(names.len());
            for (j, name) in names.iter().enumerate() {
                let column = batch.column(j);
                let value = if column.is_null(i) {
                    SqlValue::Null
                } else {
                    match column.data_type() {
                        DataType::Int64 => SqlValue::Integer(
                            column
                                .as_any()
                                .downcast_ref::<Int64Array>()
                                .context("int64 column")?
                                .value(i),
                        ),
                        DataType::Float64 => SqlValue::Real(
                            column
                                .as_any()
                                .downcast_ref::<Float64Array>()
                                .context("float64 column")?
                                .value(i),
                        ),
                        DataType::Utf8 => SqlValue::Text(
                            column
                                .as_any()
                                .downcast_ref::<StringArray>()
                                .context("utf8 column")?
                                .value(i)
                                .to_owned(),
                        ),
                        DataType::Binary => SqlValue::Blob(
                            column
                                .as_any()
                                .downcast_ref::<BinaryArray>()
                                .context("binary column")?
                                .value(i)
                                .to_vec(),
                        ),
                        other => bail!("unsupported arrow type {other:?}"),
                    }
                };
                row.push((name.clone(), value));
            }
            rows.push(row);
        }
    }
    Ok((names, rows))
}
