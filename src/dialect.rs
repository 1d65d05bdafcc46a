// Dialect layer.
// A small strategy object per SQL dialect. Everything dialect-specific the
// compiler and the adapters need lives here: placeholder style, boolean
// literals, JSON extraction, and bind-parameter limits that drive transparent
// batch chunking. Also the bounded LRU statement cache the adapters share.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }

    /// Placeholder for the 1-based parameter position.
    pub fn placeholder(&self, position: usize) -> String {
        match self {
            Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${position}"),
        }
    }

    pub fn bool_literal(&self, value: bool) -> &'static str {
        match (self, value) {
            (Self::Sqlite, true) => "1",
            (Self::Sqlite, false) => "0",
            (Self::Postgres, true) => "TRUE",
            (Self::Postgres, false) => "FALSE",
        }
    }

    /// Text-valued extraction of a dotted path from a JSON column.
    pub fn json_extract(&self, column: &str, path: &[&str]) -> String {
        match self {
            Self::Sqlite => {
                let dotted = path.join(".");
                format!("json_extract({column}, '$.{dotted}')")
            }
            Self::Postgres => {
                let braced = path.join(",");
                format!("({column} #>> '{{{braced}}}')")
            }
        }
    }

    /// Wrap a JSON extraction for numeric comparison. SQLite's json_extract
    /// already yields typed values; PostgreSQL's `#>>` yields text. DOUBLE
    /// PRECISION keeps aggregate outputs decodable without NUMERIC support.
    pub fn numeric_cast(&self, expr: &str) -> String {
        match self {
            Self::Sqlite => expr.to_string(),
            Self::Postgres => format!("CAST({expr} AS DOUBLE PRECISION)"),
        }
    }

    /// Hard limit on bind parameters per statement; multi-row writes chunk
    /// against this.
    pub fn max_bind_params(&self) -> usize {
        match self {
            Self::Sqlite => 999,
            Self::Postgres => 65_535,
        }
    }

    pub fn supports_jsonb(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// Rows per INSERT chunk for a given column count, always at least one.
    pub fn batch_chunk_rows(&self, columns_per_row: usize) -> usize {
        (self.max_bind_params() / columns_per_row.max(1)).max(1)
    }
}

/// Bounded LRU cache keyed by compiled SQL text. Oldest entry is evicted when
/// the configured capacity is exceeded.
pub struct StatementCache<V> {
    capacity: usize,
    map: HashMap<String, V>,
    access_order: Vec<String>,
}

impl<V> StatementCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::with_capacity(capacity),
            access_order: Vec::with_capacity(capacity),
        }
    }

    pub fn get(&mut self, sql: &str) -> Option<&V> {
        if self.map.contains_key(sql) {
            self.access_order.retain(|k| k != sql);
            self.access_order.push(sql.to_string());
            self.map.get(sql)
        } else {
            None
        }
    }

    pub fn insert(&mut self, sql: String, value: V) {
        if self.map.len() >= self.capacity && !self.map.contains_key(&sql) {
            if let Some(oldest) = self.access_order.first().cloned() {
                self.access_order.remove(0);
                self.map.remove(&oldest);
            }
        }
        self.map.insert(sql.clone(), value);
        self.access_order.retain(|k| k != &sql);
        self.access_order.push(sql);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Thread-safe handle around a [`StatementCache`], shared by the adapters.
#[derive(Clone)]
pub struct SharedStatementCache<V> {
    inner: Arc<Mutex<StatementCache<V>>>,
}

impl<V: Clone> SharedStatementCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatementCache::new(capacity))),
        }
    }

    pub fn get(&self, sql: &str) -> Option<V> {
        self.inner.lock().get(sql).cloned()
    }

    pub fn insert(&self, sql: String, value: V) {
        self.inner.lock().insert(sql, value);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
