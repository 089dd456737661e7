//! In-memory census source for testing collectors without a running server.

use super::scraper::ScrapeError;
use super::source::{CensusCursor, CensusSource, ConnectionRecord};

/// Scripted census source.
///
/// Serves a fixed list of rows and can be told to fail the query itself or
/// to fail while fetching/decoding a specific row. Keeps track of opened and
/// closed cursors so tests can check that every exit path releases them.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    rows: Vec<ConnectionRecord>,
    query_error: Option<String>,
    decode_error_at: Option<usize>,
    fetch_error_at: Option<usize>,
    server_version: Option<f64>,
    last_query: Option<String>,
    opened: usize,
    closed: usize,
}

impl MockSource {
    /// Creates a source with an empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source serving the given rows.
    pub fn with_rows(rows: impl IntoIterator<Item = ConnectionRecord>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Appends a row.
    pub fn push(&mut self, user: &str, host: &str, database: Option<&str>, command: &str) {
        self.rows
            .push(ConnectionRecord::new(user, host, database, command));
    }

    /// Makes `open_cursor` fail with the given message.
    pub fn fail_query(mut self, message: &str) -> Self {
        self.query_error = Some(message.to_string());
        self
    }

    /// Makes the given 1-based row fail to decode.
    pub fn fail_decode_at(mut self, row: usize) -> Self {
        self.decode_error_at = Some(row);
        self
    }

    /// Makes fetching the given 1-based row fail (lost connection, cancel).
    pub fn fail_fetch_at(mut self, row: usize) -> Self {
        self.fetch_error_at = Some(row);
        self
    }

    pub fn with_server_version(mut self, version: f64) -> Self {
        self.server_version = Some(version);
        self
    }

    /// Query text passed to the last `open_cursor` call.
    pub fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    pub fn cursors_opened(&self) -> usize {
        self.opened
    }

    pub fn cursors_closed(&self) -> usize {
        self.closed
    }

    /// A small cluster: two applications, a replica user and an idle admin.
    pub fn typical_cluster() -> Self {
        let mut source = Self::new().with_server_version(16.0);
        source.push("app", "10.0.0.5:51234", Some("shop"), "Query");
        source.push("app", "10.0.0.5:51240", Some("shop"), "Sleep");
        source.push("app", "10.0.0.6:40100", Some("shop"), "idle in transaction");
        source.push("reporting", "10.0.0.7:60000", Some("analytics"), "Query");
        source.push("replicator", "10.0.1.2:45002", None, "Query");
        source.push("postgres", "", Some("postgres"), "Sleep");
        source
    }
}

impl CensusSource for MockSource {
    fn open_cursor(&mut self, query: &str) -> Result<Box<dyn CensusCursor + '_>, ScrapeError> {
        self.last_query = Some(query.to_string());
        if let Some(ref msg) = self.query_error {
            return Err(ScrapeError::Query(msg.clone()));
        }
        self.opened += 1;
        Ok(Box::new(MockCursor {
            source: self,
            position: 0,
            closed: false,
        }))
    }

    fn server_version(&mut self) -> Option<f64> {
        self.server_version
    }
}

struct MockCursor<'a> {
    source: &'a mut MockSource,
    position: usize,
    closed: bool,
}

impl CensusCursor for MockCursor<'_> {
    fn next_record(&mut self) -> Result<Option<ConnectionRecord>, ScrapeError> {
        if self.closed || self.position >= self.source.rows.len() {
            return Ok(None);
        }
        self.position += 1;

        if self.source.fetch_error_at == Some(self.position) {
            return Err(ScrapeError::Query("connection lost".to_string()));
        }
        if self.source.decode_error_at == Some(self.position) {
            return Err(ScrapeError::Decode {
                row: self.position,
                message: "unexpected NULL in column 0".to_string(),
            });
        }

        Ok(Some(self.source.rows[self.position - 1].clone()))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.closed += 1;
        }
    }
}

impl Drop for MockCursor<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut MockSource) -> Result<Vec<ConnectionRecord>, ScrapeError> {
        let mut cursor = source.open_cursor("SELECT 1")?;
        let mut records = Vec::new();
        while let Some(record) = cursor.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    #[test]
    fn test_typical_cluster_serves_all_rows() {
        let mut source = MockSource::typical_cluster();
        let records = drain(&mut source).unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records[4].database, None);
        assert_eq!(source.last_query(), Some("SELECT 1"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut source = MockSource::typical_cluster();
        {
            let mut cursor = source.open_cursor("SELECT 1").unwrap();
            cursor.close();
            cursor.close();
            assert_eq!(cursor.next_record().unwrap(), None);
        }
        assert_eq!(source.cursors_opened(), 1);
        assert_eq!(source.cursors_closed(), 1);
    }

    #[test]
    fn test_dropped_cursor_is_closed() {
        let mut source = MockSource::typical_cluster().fail_decode_at(2);
        let err = drain(&mut source).unwrap_err();
        assert!(matches!(err, ScrapeError::Decode { row: 2, .. }));
        assert_eq!(source.cursors_closed(), 1);
    }

    #[test]
    fn test_query_failure_opens_no_cursor() {
        let mut source = MockSource::typical_cluster().fail_query("permission denied");
        let err = drain(&mut source).unwrap_err();
        assert_eq!(err, ScrapeError::Query("permission denied".to_string()));
        assert_eq!(source.cursors_opened(), 0);
        assert_eq!(source.cursors_closed(), 0);
    }
}
