//! Timeout and retry policy applied to every query.

use std::time::Duration;

use protocol::{Envelope, ErrorKind, Payload, QueryResult};

use crate::source::{DataSource, SourceError};

/// Terminal failure of a dispatched query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Failed(SourceError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: SourceError },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Failed(err) => err.kind(),
            DispatchError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let envelope = Envelope::error(self.kind(), self.to_string());
        match self {
            DispatchError::Failed(_) => envelope,
            DispatchError::RetriesExhausted { attempts, last } => envelope
                .with_field("attempts", *attempts)
                .with_field("cause", last.kind().as_str()),
        }
    }
}

/// Runs `query` against `source` under the source's timeout and retry policy.
///
/// Every attempt races the backend against `timeout`; the losing backend
/// future is dropped. A disconnected source is connected before the attempt,
/// and a connection-level failure makes the next attempt reconnect.
pub async fn dispatch(
    source: &dyn DataSource,
    query: &str,
    params: &Payload,
) -> Result<QueryResult, DispatchError> {
    let config = source.config();
    let max_attempts = config.max_retries().saturating_add(1);
    let mut reconnect = false;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match run_attempt(source, query, params, config.timeout(), reconnect).await {
            Ok(result) => {
                if attempt > 1 {
                    log::info!(
                        "Query on '{}' succeeded on attempt {}",
                        source.id(),
                        attempt
                    );
                }
                return Ok(result);
            }
            Err(err) => err,
        };

        if !err.is_retryable() || max_attempts == 1 {
            return Err(DispatchError::Failed(err));
        }

        log::warn!(
            "Attempt {}/{} on '{}' failed: {}",
            attempt,
            max_attempts,
            source.id(),
            err
        );

        if attempt >= max_attempts {
            return Err(DispatchError::RetriesExhausted {
                attempts: attempt,
                last: err,
            });
        }

        reconnect = err.is_connection_level();
    }
}

async fn run_attempt(
    source: &dyn DataSource,
    query: &str,
    params: &Payload,
    timeout: Duration,
    reconnect: bool,
) -> Result<QueryResult, SourceError> {
    let attempt = async {
        if reconnect {
            source.reconnect().await?;
        } else if !source.is_connected().await {
            source.connect().await?;
        }
        source.execute(query, params).await
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(outcome) => outcome,
        Err(_) => Err(SourceError::Timeout {
            source_id: source.id().to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
