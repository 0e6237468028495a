//! Driver abstraction consumed by the pool.
//!
//! The pool never speaks a database wire protocol itself. A [`Driver`] opens
//! [`DriverConnection`] handles against a [`ConnectTarget`], and the pool
//! manages their lifecycle: checkout, release, health probing, recycling and
//! shutdown.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Credentials, PoolConfig};
use crate::error::DriverError;

/// Where and as whom a driver should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Server address in the driver's own format.
    pub server_address: String,
    /// Login credentials.
    pub credentials: Credentials,
}

impl ConnectTarget {
    pub(crate) fn from_config(config: &PoolConfig) -> Self {
        Self {
            server_address: config.server_address.clone(),
            credentials: config.credentials.clone(),
        }
    }
}

/// Factory for database connections.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Id the driver is registered under.
    fn id(&self) -> &str;

    /// Open a new connection.
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Box<dyn DriverConnection>, DriverError>;
}

/// A live connection opened by a [`Driver`].
#[async_trait]
pub trait DriverConnection: Send {
    /// Human-readable tag, unique among the connections a driver has open.
    ///
    /// The pool uses it to map a returned handle back to its slot.
    fn identity(&self) -> String;

    /// Whether the handle reports itself closed.
    fn is_closed(&self) -> bool;

    /// Take and clear any warnings accumulated on the connection.
    fn take_warnings(&mut self) -> Vec<String>;

    /// Trivial liveness probe.
    async fn ping(&mut self) -> Result<(), DriverError>;

    /// Run a statement that does not return rows. Returns rows affected.
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Run a statement that returns rows.
    async fn query(&mut self, sql: &str) -> Result<Rows, DriverError>;

    /// Commit the current unit of work.
    async fn commit(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Close the connection.
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Registered drivers, keyed by id.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its own id, replacing any previous one.
    #[must_use]
    pub fn with(mut self, driver: Arc<dyn Driver>) -> Self {
        self.register(driver);
        self
    }

    /// Register a driver under its own id, replacing any previous one.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.id().to_string(), driver);
    }

    /// Look up a driver.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(id).cloned()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Check if the value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the value as an integer, if it is one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as a float. Integers are widened.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get the value as text, if it is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// A row from a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Get a value by column index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name (case-insensitive).
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }

    /// Get the number of columns in the row.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl IntoIterator for Row {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

/// A fully materialized result set.
///
/// Rows are buffered so the connection can go back to the pool before the
/// caller looks at them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    columns: Arc<[String]>,
    rows: Vec<Row>,
}

impl Rows {
    /// Create an empty result set with the given columns.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row. Missing trailing values are filled with NULL.
    pub fn push(&mut self, mut values: Vec<Value>) {
        values.resize(self.columns.len(), Value::Null);
        self.rows.push(Row {
            columns: Arc::clone(&self.columns),
            values,
        });
    }

    /// Column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate over the rows.
    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    /// Take the first row, if any.
    #[must_use]
    pub fn into_first(self) -> Option<Row> {
        self.rows.into_iter().next()
    }
}

impl IntoIterator for Rows {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a Rows {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
