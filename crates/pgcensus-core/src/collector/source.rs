//! Query executors for the connection census.
//!
//! A [`CensusSource`] runs the census query and hands back a forward-only
//! [`CensusCursor`] that yields positionally-bound [`ConnectionRecord`]s.
//! [`PostgresSource`] is the production implementation; tests use
//! [`MockSource`](super::mock::MockSource).

use std::time::Duration;

use postgres::fallible_iterator::FallibleIterator;
use postgres::types::ToSql;
use postgres::{CancelToken, Client, Config, NoTls, Row, RowIter};
use tracing::{debug, info, warn};

use super::scraper::ScrapeError;

/// Number of columns the census query returns.
pub const CENSUS_COLUMNS: usize = 4;

/// One row of the census query, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub user: String,
    /// Raw client host, possibly with a `:port` suffix.
    pub host: String,
    pub database: Option<String>,
    /// Raw state/command token (`Query`, `Sleep`, ...).
    pub command: String,
}

impl ConnectionRecord {
    pub fn new(user: &str, host: &str, database: Option<&str>, command: &str) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
            database: database.map(str::to_string),
            command: command.to_string(),
        }
    }
}

/// Runs the census query against a target server.
pub trait CensusSource {
    /// Executes `query` and returns a cursor over its rows.
    fn open_cursor(&mut self, query: &str) -> Result<Box<dyn CensusCursor + '_>, ScrapeError>;

    /// Server version as `major.minor`, if known. Must not contact the server.
    fn server_version(&mut self) -> Option<f64> {
        None
    }
}

/// Forward-only cursor over census rows.
///
/// Dropping the cursor releases it; `close` does the same eagerly and may be
/// called any number of times.
pub trait CensusCursor {
    /// Fetches and binds the next row, or `None` once the result set is exhausted.
    fn next_record(&mut self) -> Result<Option<ConnectionRecord>, ScrapeError>;

    fn close(&mut self);
}

/// Error type for building a [`PostgresSource`].
#[derive(Debug)]
pub enum SourceError {
    /// Environment variable not set.
    EnvNotSet(String),
    /// Connection string could not be parsed.
    InvalidConfig(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::EnvNotSet(var) => write!(f, "PostgreSQL: {} not set", var),
            SourceError::InvalidConfig(msg) => {
                write!(f, "PostgreSQL: invalid connection string: {}", msg)
            }
        }
    }
}

impl std::error::Error for SourceError {}

/// PostgreSQL census source.
///
/// Connects lazily on first use and reconnects when the previous
/// connection was closed by the server or the network.
pub struct PostgresSource {
    config: Config,
    client: Option<Client>,
    server_version_num: Option<i32>,
    connect_attempts: u64,
}

impl PostgresSource {
    /// Creates a source from the standard libpq environment variables:
    /// - PGHOST (default: localhost)
    /// - PGPORT (default: 5432)
    /// - PGUSER (default: $USER)
    /// - PGPASSWORD (default: empty)
    /// - PGDATABASE (default: same as PGUSER)
    pub fn from_env() -> Result<Self, SourceError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| SourceError::EnvNotSet("PGUSER or USER".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let connection_string = if password.is_empty() {
            format!(
                "host={} port={} user={} dbname={}",
                host, port, user, database
            )
        } else {
            format!(
                "host={} port={} user={} password={} dbname={}",
                host, port, user, password, database
            )
        };

        Self::with_connection_string(&connection_string)
    }

    /// Creates a source from a libpq-style or URL connection string.
    pub fn with_connection_string(connection_string: &str) -> Result<Self, SourceError> {
        let config = connection_string
            .parse::<Config>()
            .map_err(|e| SourceError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            config,
            client: None,
            server_version_num: None,
            connect_attempts: 0,
        })
    }

    /// Applies a connect timeout and a server-side `statement_timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let statement_timeout = format!("-c statement_timeout={}", timeout.as_millis());
        let options = match self.config.get_options() {
            Some(existing) if !existing.is_empty() => format!("{} {}", existing, statement_timeout),
            _ => statement_timeout,
        };
        self.config.connect_timeout(timeout);
        self.config.options(&options);
        self
    }

    /// Attempts to connect, returning the formatted failure if any.
    pub fn try_connect(&mut self) -> Result<(), ScrapeError> {
        self.ensure_connected().map(|_| ())
    }

    /// Number of connection attempts made so far, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    /// Token for cancelling a query running on the current connection.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.client.as_ref().map(Client::cancel_token)
    }

    fn ensure_connected(&mut self) -> Result<&mut Client, ScrapeError> {
        let client = match self.client.take() {
            Some(client) if !client.is_closed() => client,
            previous => {
                if previous.is_some() {
                    warn!("PostgreSQL connection closed, reconnecting");
                }
                self.connect()?
            }
        };
        Ok(self.client.insert(client))
    }

    fn connect(&mut self) -> Result<Client, ScrapeError> {
        self.connect_attempts += 1;
        match self.config.connect(NoTls) {
            Ok(mut client) => {
                // Determine server version once per (re)connect.
                self.server_version_num = client
                    .query_one("SHOW server_version_num", &[])
                    .ok()
                    .and_then(|row| row.try_get::<_, String>(0).ok())
                    .and_then(|v| v.parse::<i32>().ok());
                info!(server_version_num = ?self.server_version_num, "connected to PostgreSQL");
                Ok(client)
            }
            Err(e) => {
                self.server_version_num = None;
                Err(ScrapeError::Query(format_postgres_error(&e)))
            }
        }
    }
}

impl CensusSource for PostgresSource {
    fn open_cursor(&mut self, query: &str) -> Result<Box<dyn CensusCursor + '_>, ScrapeError> {
        let client = self.ensure_connected()?;
        match client.query_raw(query, std::iter::empty::<&dyn ToSql>()) {
            Ok(rows) => Ok(Box::new(PostgresCursor {
                rows: Some(rows),
                fetched: 0,
            })),
            Err(e) => {
                let msg = format_postgres_error(&e);
                warn!(error = %msg, "census query failed");
                Err(ScrapeError::Query(msg))
            }
        }
    }

    /// Version cached at the last successful connect; `None` before the first one.
    fn server_version(&mut self) -> Option<f64> {
        self.server_version_num.map(version_from_num)
    }
}

/// Cursor over a `query_raw` result stream.
struct PostgresCursor<'a> {
    rows: Option<RowIter<'a>>,
    fetched: usize,
}

impl CensusCursor for PostgresCursor<'_> {
    fn next_record(&mut self) -> Result<Option<ConnectionRecord>, ScrapeError> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };

        match rows.next() {
            Ok(Some(row)) => {
                self.fetched += 1;
                decode_row(&row, self.fetched).map(Some)
            }
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => Err(ScrapeError::Query(format_postgres_error(&e))),
        }
    }

    fn close(&mut self) {
        if self.rows.take().is_some() {
            debug!(rows = self.fetched, "census cursor closed");
        }
    }
}

/// Binds the four census columns positionally.
fn decode_row(row: &Row, number: usize) -> Result<ConnectionRecord, ScrapeError> {
    if row.len() != CENSUS_COLUMNS {
        return Err(ScrapeError::Decode {
            row: number,
            message: format!("expected {} columns, got {}", CENSUS_COLUMNS, row.len()),
        });
    }

    let decode_err = |idx: usize, e: postgres::Error| ScrapeError::Decode {
        row: number,
        message: format!("column {}: {}", idx, e),
    };
    let text = |idx: usize| row.try_get::<_, String>(idx).map_err(|e| decode_err(idx, e));

    Ok(ConnectionRecord {
        user: text(0)?,
        host: text(1)?,
        database: row
            .try_get::<_, Option<String>>(2)
            .map_err(|e| decode_err(2, e))?,
        command: text(3)?,
    })
}

/// Converts `server_version_num` into `major.minor`.
///
/// Before PostgreSQL 10 the minor component is part of the major release
/// (`90600` is 9.6); from 10 on only the major number is significant.
pub fn version_from_num(num: i32) -> f64 {
    let major = num / 10000;
    let minor = if major >= 10 { 0 } else { (num / 100) % 100 };
    major as f64 + minor as f64 / 10.0
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}
