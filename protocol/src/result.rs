//! Query results returned by data sources.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{ErrorKind, Payload, Row};

/// Rows plus metadata produced by one query.
///
/// A failed result never carries rows: every constructor and the
/// deserializer drop `data` when an error is present.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(from = "QueryResultRepr")]
pub struct QueryResult {
    data: Vec<Row>,
    metadata: Payload,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_time_ms: Option<f64>,
}

#[derive(Deserialize)]
struct QueryResultRepr {
    #[serde(default)]
    data: Vec<Row>,
    #[serde(default)]
    metadata: Payload,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_kind: Option<ErrorKind>,
    #[serde(default)]
    query_time_ms: Option<f64>,
}

impl From<QueryResultRepr> for QueryResult {
    fn from(repr: QueryResultRepr) -> Self {
        let failed = repr.error.is_some() || repr.error_kind.is_some();
        Self {
            data: if failed { Vec::new() } else { repr.data },
            metadata: repr.metadata,
            error: match (repr.error, repr.error_kind) {
                (Some(message), _) => Some(message),
                (None, Some(kind)) => Some(kind.to_string()),
                (None, None) => None,
            },
            error_kind: repr.error_kind,
            query_time_ms: repr.query_time_ms,
        }
    }
}

impl QueryResult {
    /// Successful result holding `data`.
    #[must_use]
    pub fn rows(data: Vec<Row>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Failed result; `data` is always empty.
    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            error_kind: Some(kind),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn not_connected(source: &str) -> Self {
        Self::failure(
            ErrorKind::NotConnected,
            format!("data source '{source}' is not connected"),
        )
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_query_time_ms(mut self, elapsed_ms: f64) -> Self {
        self.query_time_ms = Some(elapsed_ms);
        self
    }

    #[must_use]
    pub fn data(&self) -> &[Row] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<Row> {
        self.data
    }

    #[must_use]
    pub fn metadata(&self) -> &Payload {
        &self.metadata
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Failure kind; `QueryFailed` when only a message was supplied.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match (&self.error, self.error_kind) {
            (_, Some(kind)) => Some(kind),
            (Some(_), None) => Some(ErrorKind::QueryFailed),
            (None, None) => None,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn query_time_ms(&self) -> Option<f64> {
        self.query_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row
    }

    #[test]
    fn failure_has_no_rows() {
        let result = QueryResult::failure(ErrorKind::Timeout, "took too long")
            .with_metadata("attempt", 1);
        assert!(result.data().is_empty());
        assert_eq!(result.error(), Some("took too long"));
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    }

    #[test]
    fn deserializer_drops_rows_when_error_present() {
        let raw = json!({
            "data": [{"id": 1}],
            "metadata": {},
            "error": "boom"
        });
        let result: QueryResult = serde_json::from_value(raw).unwrap();
        assert!(result.data().is_empty());
        assert_eq!(result.error_kind(), Some(ErrorKind::QueryFailed));
    }

    #[test]
    fn success_serializes_null_error() {
        let result = QueryResult::rows(vec![row(1)]);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["data"], json!([{"id": 1}]));
        assert_eq!(value["error"], json!(null));
        assert!(value.get("error_kind").is_none());
    }
}
