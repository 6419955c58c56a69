//! Batch cursor — pages through a collection without holding it wholly
//! in memory.
//!
//! Each `next_batch` call allocates a fresh `Vec` that the caller drops
//! before asking for the next one. That scope-bounded ownership is the
//! property that keeps multi-hundred-thousand-record collections
//! processable at a fixed memory ceiling; nothing here caches rows
//! across batches.

use super::{DocStore, SourceRecord};
use crate::error::{EngineError, EngineResult};
use rusqlite::types::Value as SqlValue;

pub struct BatchCursor<'a> {
    store: &'a DocStore,
    select_sql: String,
    filter_params: Vec<SqlValue>,
    batch_size: usize,
    last_id: i64,
    done: bool,
}

impl<'a> BatchCursor<'a> {
    pub(super) fn new(
        store: &'a DocStore,
        collection: &str,
        filter: Option<&serde_json::Map<String, serde_json::Value>>,
        batch_size: usize,
    ) -> EngineResult<Self> {
        let exists = store.collection_exists(collection)?;

        let mut where_clauses = vec!["id > ?1".to_string()];
        let mut filter_params = Vec::new();
        if let Some(filter) = filter {
            for (field, value) in filter {
                // A double quote would terminate the quoted JSON path
                // component; no legitimate field name carries one.
                if field.contains('"') {
                    return Err(EngineError::Config {
                        report: collection.to_string(),
                        reason: format!("invalid filter field '{field}'"),
                    });
                }
                // Parameter 1 is the cursor position; each filter binds
                // its JSON path and value, so field names never splice
                // into the statement text.
                let path_index = filter_params.len() + 2;
                where_clauses.push(format!(
                    "json_extract(body, ?{path_index}) = ?{}",
                    path_index + 1
                ));
                filter_params.push(SqlValue::Text(format!("$.\"{field}\"")));
                filter_params.push(to_sql_value(value));
            }
        }

        let select_sql = format!(
            "SELECT id, body FROM \"{collection}\" WHERE {} ORDER BY id ASC LIMIT ?{}",
            where_clauses.join(" AND "),
            filter_params.len() + 2
        );

        Ok(Self {
            store,
            select_sql,
            filter_params,
            batch_size: batch_size.max(1),
            last_id: 0,
            done: !exists,
        })
    }

    /// Fetch the next batch. An empty vec means the cursor is finished.
    pub fn next_batch(&mut self) -> EngineResult<Vec<SourceRecord>> {
        if self.done {
            return Ok(Vec::new());
        }

        let mut params: Vec<SqlValue> = Vec::with_capacity(self.filter_params.len() + 2);
        params.push(SqlValue::Integer(self.last_id));
        params.extend(self.filter_params.iter().cloned());
        params.push(SqlValue::Integer(self.batch_size as i64));

        let mut stmt = self.store.conn().prepare(&self.select_sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut batch = Vec::with_capacity(rows.len());
        for (id, body) in rows {
            let doc = serde_json::from_str(&body)?;
            batch.push(SourceRecord { id, doc });
        }

        match batch.last() {
            Some(record) => self.last_id = record.id,
            None => self.done = true,
        }
        if batch.len() < self.batch_size {
            self.done = true;
        }
        Ok(batch)
    }
}

fn to_sql_value(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
