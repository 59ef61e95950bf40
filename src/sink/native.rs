//! ClickHouse native protocol, JSON rows converted into column values
use std::sync::Arc;

use async_trait::async_trait;
use clickhouse_rs::types::{SqlType, Value as CHValue};
use clickhouse_rs::{Block, Pool};
use serde_json::{Map, Value};

use super::Sink;
use crate::error::SinkError;
use crate::events::Event;

/// ClickHouse row - vector of columns, each column is tuple of its name and value
pub type Row = Vec<(String, CHValue)>;

pub struct NativeSink {
    pool: Pool,
}

impl NativeSink {
    /// `url` is a clickhouse-rs connection url, e.g. `tcp://localhost:9000/analytics`
    pub fn new(url: &str) -> NativeSink {
        NativeSink {
            pool: Pool::new(url.to_owned()),
        }
    }
}

#[async_trait]
impl Sink<Event> for NativeSink {
    async fn write(&self, table: &str, rows: &[Event]) -> Result<(), SinkError> {
        let mut block = Block::with_capacity(rows.len());
        for row in rows {
            block.push(json2row(row)?)?;
        }
        let mut handle = self.pool.get_handle().await?;
        handle.insert(table, block).await?;
        Ok(())
    }
}

fn json2row(row: &Event) -> Result<Row, SinkError> {
    let Value::Object(columns) = row else {
        return Err(SinkError::NotAnObject);
    };
    columns
        .iter()
        .map(|(column, value)| Ok((column.to_owned(), json2ch(column, value)?)))
        .collect()
}

fn json2ch(column: &str, v: &Value) -> Result<CHValue, SinkError> {
    let unsupported = |reason| SinkError::UnsupportedValue {
        column: column.to_owned(),
        reason,
    };
    match v {
        Value::Null => Err(unsupported("unexpected null")),
        Value::Bool(x) => Ok(CHValue::from(u8::from(*x))),
        Value::Number(x) => {
            if let Some(i) = x.as_i64() {
                Ok(CHValue::from(i))
            } else if let Some(u) = x.as_u64() {
                Ok(CHValue::from(u))
            } else {
                x.as_f64()
                    .map(CHValue::from)
                    .ok_or_else(|| unsupported("number out of range"))
            }
        }
        Value::String(x) => Ok(CHValue::from(x.to_owned())),
        Value::Array(items) => array2ch(column, items),
        Value::Object(fields) => nested2ch(fields),
    }
}

/// Arrays must be homogeneous, element type is taken from the first element
fn array2ch(column: &str, items: &[Value]) -> Result<CHValue, SinkError> {
    let unsupported = |reason| SinkError::UnsupportedValue {
        column: column.to_owned(),
        reason,
    };
    let sql_type: &'static SqlType = match items.first() {
        None | Some(Value::String(_)) => &SqlType::String,
        Some(Value::Bool(_)) => &SqlType::UInt8,
        Some(Value::Number(x)) if x.is_i64() => &SqlType::Int64,
        Some(Value::Number(x)) if x.is_u64() => &SqlType::UInt64,
        Some(Value::Number(_)) => &SqlType::Float64,
        Some(_) => return Err(unsupported("array of nested values")),
    };
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        let value = match (sql_type, item) {
            (SqlType::String, Value::String(x)) => CHValue::from(x.to_owned()),
            (SqlType::UInt8, Value::Bool(x)) => CHValue::from(u8::from(*x)),
            (SqlType::Int64, Value::Number(x)) => {
                CHValue::from(x.as_i64().ok_or_else(|| unsupported("mixed array"))?)
            }
            (SqlType::UInt64, Value::Number(x)) => {
                CHValue::from(x.as_u64().ok_or_else(|| unsupported("mixed array"))?)
            }
            (SqlType::Float64, Value::Number(x)) => {
                CHValue::from(x.as_f64().ok_or_else(|| unsupported("mixed array"))?)
            }
            _ => return Err(unsupported("mixed array")),
        };
        values.push(value);
    }
    Ok(CHValue::Array(sql_type, Arc::new(values)))
}

// nested objects land in String columns as JSON documents
fn nested2ch(fields: &Map<String, Value>) -> Result<CHValue, SinkError> {
    Ok(CHValue::from(serde_json::to_string(fields)?))
}
