//! Physical connectivity abstraction. The pool logic never talks to a
//! driver directly; it goes through this trait, so pool invariants can
//! be tested without a real database.

use async_trait::async_trait;
use dataplane_core::{Result, Row, Value};

/// One physical connection. The pool treats this as an opaque handle;
/// only the connector knows how to open, probe, and close it.
#[async_trait]
pub trait PhysicalConnection: Send + Sync {
    /// Cheap liveness probe used by pool health maintenance
    async fn ping(&self) -> bool;

    /// Runs one query to completion and returns its result rows. The
    /// data plane's job stops at routing and lifecycle, not query
    /// semantics, so this stays a thin pass-through to the
    /// underlying driver rather than a query engine.
    async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, dsn: &str) -> Result<Box<dyn PhysicalConnection>>;
}

/// Production connector: one `sqlx::AnyPool`-backed connection per
/// handle, dialect-dispatched on the DSN scheme. Kept intentionally
/// thin — the data plane's job is routing and lifecycle, not query
/// execution semantics.
pub struct SqlxConnector;

struct SqlxConnection {
    pool: sqlx::AnyPool,
}

#[async_trait]
impl PhysicalConnection for SqlxConnection {
    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut built = sqlx::query(query);
        for p in params {
            built = bind_any(built, p);
        }
        let rows = built.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(any_row_to_row).collect())
    }
}

type AnyQuery<'q> = sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>;

fn bind_any<'q>(query: AnyQuery<'q>, value: &'q Value) -> AnyQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.as_str()),
        Value::Bytes(b) => query.bind(b.as_slice()),
        Value::Timestamp(t) => query.bind(t.to_rfc3339()),
    }
}

/// Best-effort column decode: the `Any` driver erases the source type,
/// so we probe the common SQL types in order rather than carrying a
/// schema. Good enough for cache keys and row shaping; not a type system.
fn any_row_to_row(row: &sqlx::any::AnyRow) -> Row {
    use sqlx::{Column, Row as _};
    let mut out = Row::new();
    for col in row.columns() {
        let name = col.name().to_string();
        let value = if let Ok(v) = row.try_get::<i64, _>(name.as_str()) {
            Value::Int(v)
        } else if let Ok(v) = row.try_get::<f64, _>(name.as_str()) {
            Value::Float(v)
        } else if let Ok(v) = row.try_get::<String, _>(name.as_str()) {
            Value::Text(v)
        } else if let Ok(v) = row.try_get::<Vec<u8>, _>(name.as_str()) {
            Value::Bytes(v)
        } else {
            Value::Null
        };
        out.push(name, value);
    }
    out
}

#[async_trait]
impl Connector for SqlxConnector {
    async fn connect(&self, dsn: &str) -> Result<Box<dyn PhysicalConnection>> {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect(dsn)
            .await?;
        Ok(Box::new(SqlxConnection { pool }))
    }
}

/// Deterministic, offline connector used by tests and by callers who
/// want to exercise the data plane without a live database. Connections
/// never fail to open; a shared flag lets a test flip liveness to
/// exercise health-maintenance eviction.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub struct MockConnector {
        pub alive: Arc<AtomicBool>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self {
                alive: Arc::new(AtomicBool::new(true)),
            }
        }

        pub fn kill(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    impl Default for MockConnector {
        fn default() -> Self {
            Self::new()
        }
    }

    struct MockConnection {
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PhysicalConnection for MockConnection {
        async fn ping(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn execute(&self, query: &str, _params: &[Value]) -> Result<Vec<Row>> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(dataplane_core::Error::ConnectionInvalid(
                    "mock connection killed".into(),
                ));
            }
            let mut row = Row::new();
            row.push("query".to_string(), Value::Text(query.to_string()));
            Ok(vec![row])
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _dsn: &str) -> Result<Box<dyn PhysicalConnection>> {
            Ok(Box::new(MockConnection {
                alive: self.alive.clone(),
            }))
        }
    }
}
