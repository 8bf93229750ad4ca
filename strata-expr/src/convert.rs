//! Bridging between Arrow record batches and `Value` rows.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, RecordBatch, RecordBatchOptions, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, SchemaRef};
use strata_result::{Error, Result};

/// Read one cell out of an Arrow array.
pub fn value_at(array: &dyn Array, row: usize) -> Result<crate::Value> {
    use crate::Value;
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    match array.data_type() {
        DataType::Int64 => Ok(Value::Int(downcast::<Int64Array>(array)?.value(row))),
        DataType::Float64 => Ok(Value::Float(downcast::<Float64Array>(array)?.value(row))),
        DataType::Utf8 => Ok(Value::Str(
            downcast::<StringArray>(array)?.value(row).to_string(),
        )),
        DataType::Boolean => Ok(Value::Bool(downcast::<BooleanArray>(array)?.value(row))),
        other => Err(Error::NotImplemented(format!(
            "unsupported column type {other:?}"
        ))),
    }
}

fn downcast<T: 'static>(array: &dyn Array) -> Result<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Internal("array type does not match its declared data type".into()))
}

/// Convert a record batch into row-major `Value` rows.
pub fn batch_rows(batch: &RecordBatch) -> Result<Vec<Vec<crate::Value>>> {
    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut values = Vec::with_capacity(batch.num_columns());
        for column in batch.columns() {
            values.push(value_at(column.as_ref(), row)?);
        }
        rows.push(values);
    }
    Ok(rows)
}

/// Build an Arrow array of `data_type` from values.
pub fn array_from_values<'a>(
    data_type: &DataType,
    values: impl Iterator<Item = &'a crate::Value>,
) -> Result<ArrayRef> {
    use crate::Value;
    let type_err = |value: &Value| {
        Error::Internal(format!(
            "value {value:?} does not match column type {data_type:?}"
        ))
    };
    match data_type {
        DataType::Int64 => {
            let mut builder = Int64Builder::new();
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Int(v) => builder.append_value(*v),
                    other => return Err(type_err(other)),
                }
            }
            Ok(Arc::new(builder.finish()) as ArrayRef)
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::new();
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Float(v) => builder.append_value(*v),
                    Value::Int(v) => builder.append_value(*v as f64),
                    other => return Err(type_err(other)),
                }
            }
            Ok(Arc::new(builder.finish()) as ArrayRef)
        }
        DataType::Utf8 => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Str(s) => builder.append_value(s),
                    other => return Err(type_err(other)),
                }
            }
            Ok(Arc::new(builder.finish()) as ArrayRef)
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::new();
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Bool(b) => builder.append_value(*b),
                    other => return Err(type_err(other)),
                }
            }
            Ok(Arc::new(builder.finish()) as ArrayRef)
        }
        other => Err(Error::NotImplemented(format!(
            "unsupported column type {other:?}"
        ))),
    }
}

/// Build a record batch from column-major values.
pub fn columns_to_batch(
    schema: SchemaRef,
    columns: &[Vec<crate::Value>],
    num_rows: usize,
) -> Result<RecordBatch> {
    debug_assert_eq!(schema.fields().len(), columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (field, values) in schema.fields().iter().zip(columns) {
        arrays.push(array_from_values(field.data_type(), values.iter())?);
    }
    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    RecordBatch::try_new_with_options(schema, arrays, &options).map_err(Error::Arrow)
}

/// Build a record batch from row-major values.
pub fn rows_to_batch(schema: SchemaRef, rows: &[Vec<crate::Value>]) -> Result<RecordBatch> {
    let width = schema.fields().len();
    let mut columns: Vec<Vec<crate::Value>> = vec![Vec::with_capacity(rows.len()); width];
    for row in rows {
        if row.len() != width {
            return Err(Error::Internal(format!(
                "row has {} values but the schema has {width} fields",
                row.len()
            )));
        }
        for (column, value) in columns.iter_mut().zip(row) {
            column.push(value.clone());
        }
    }
    columns_to_batch(schema, &columns, rows.len())
}
