use alloy::{
    primitives::B256,
    rpc::json_rpc::RpcError as JsonRpcError,
    transports::{TransportError, TransportErrorKind},
};
use common::{BlockNum, BoxError};
use datasets_raw::AssembleError;

/// JSON-RPC error code some providers use for request throttling.
const RATE_LIMIT_CODE: i64 = -32005;

/// Errors returned by a single remote call.
///
/// The variants separate transient failures, which the fetcher retries with backoff, from
/// permanent ones, which fail the request immediately.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The request never produced a JSON-RPC response.
    ///
    /// This covers connection failures, timeouts and non-success HTTP statuses other than
    /// throttling. These are treated as transient and retried.
    #[error("transport error")]
    Transport(#[source] BoxError),

    /// The provider throttled the request.
    ///
    /// Raised for HTTP 429 responses, the `-32005` JSON-RPC error code, and error messages that
    /// mention rate limiting. Always retried.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The node answered with a JSON-RPC error object.
    ///
    /// The request reached the node and was rejected, so retrying the same request is not
    /// expected to help.
    #[error("JSON-RPC error {code}: {message}")]
    Response { code: i64, message: String },

    /// The response could not be decoded into the expected shape.
    ///
    /// This usually indicates an incompatible node or a provider returning a truncated body.
    #[error("failed to decode response")]
    Decode(#[source] BoxError),
}

impl RpcError {
    /// Returns true if the call may succeed when retried.
    ///
    /// - `Transport` and `RateLimited` are transient
    /// - `Response` and `Decode` are permanent
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited(_))
    }
}

fn is_rate_limit_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("rate limit") || message.contains("too many")
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            JsonRpcError::ErrorResp(payload) => {
                let message = payload.message.to_string();
                if payload.code == RATE_LIMIT_CODE || is_rate_limit_message(&message) {
                    RpcError::RateLimited(message)
                } else {
                    RpcError::Response {
                        code: payload.code,
                        message,
                    }
                }
            }
            JsonRpcError::Transport(TransportErrorKind::HttpError(http)) if http.status == 429 => {
                RpcError::RateLimited(http.body)
            }
            err @ (JsonRpcError::DeserError { .. } | JsonRpcError::NullResp) => {
                RpcError::Decode(err.into())
            }
            err => RpcError::Transport(err.into()),
        }
    }
}

/// Errors that fail a whole chunk.
///
/// A chunk fails when any of its requests exhausts its retries, when the returned data is
/// inconsistent, or when the assembled rows do not fit the selected schema. The coordinator
/// records these in the collection report and moves on to the remaining chunks.
#[derive(Debug, thiserror::Error)]
pub enum ChunkFetchError {
    /// A request failed permanently or ran out of retries.
    #[error("{method} for {target} failed")]
    Request {
        method: &'static str,
        target: String,
        #[source]
        source: RpcError,
    },

    /// The node has no data for a requested block or transaction.
    ///
    /// Raised when a node returns `null` for a block below the resolved head or for an unknown
    /// transaction hash.
    #[error("{method} returned no data for {target}")]
    NotFound { method: &'static str, target: String },

    /// Both the coarse request and its fine-grained fallback failed.
    ///
    /// The primary error is the reason the fallback was attempted; the secondary error is the
    /// one that ended the chunk.
    #[error("fallback failed after primary error: {primary}")]
    Fallback {
        primary: Box<ChunkFetchError>,
        #[source]
        secondary: Box<ChunkFetchError>,
    },

    /// Block receipts do not line up with the block's transactions.
    #[error(
        "mismatched tx and receipt count for block {block_num}: {tx_count} txs, {receipt_count} receipts"
    )]
    ReceiptCountMismatch {
        block_num: BlockNum,
        tx_count: usize,
        receipt_count: usize,
    },

    /// A receipt belongs to a different transaction than expected at its position.
    #[error(
        "mismatched tx and receipt hash for block {block_num}: tx {tx_hash}, receipt {receipt_hash}"
    )]
    ReceiptHashMismatch {
        block_num: BlockNum,
        tx_hash: B256,
        receipt_hash: B256,
    },

    /// The fetched records do not fit the selected columns.
    ///
    /// Raised by the assembler, most often because the node omitted a field that is part of
    /// the projection.
    #[error(transparent)]
    Assemble(#[from] AssembleError),

    /// The collection was cancelled before the chunk finished.
    #[error("cancelled")]
    Cancelled,

    /// The request limiter was shut down.
    #[error("request limiter closed")]
    LimiterClosed,
}

impl ChunkFetchError {
    pub(crate) fn request(method: &'static str, target: impl ToString, source: RpcError) -> Self {
        ChunkFetchError::Request {
            method,
            target: target.to_string(),
            source,
        }
    }

    pub(crate) fn not_found(method: &'static str, target: impl ToString) -> Self {
        ChunkFetchError::NotFound {
            method,
            target: target.to_string(),
        }
    }

    /// Returns true if the error stems from cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ChunkFetchError::Cancelled => true,
            ChunkFetchError::Fallback { secondary, .. } => secondary.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy::rpc::json_rpc::ErrorPayload;

    use super::*;

    fn error_resp(code: i64, message: &'static str) -> TransportError {
        JsonRpcError::ErrorResp(ErrorPayload {
            code,
            message: message.into(),
            data: None,
        })
    }

    #[test]
    fn rate_limit_code_is_retryable() {
        //* When
        let err = RpcError::from(error_resp(-32005, "limit exceeded"));

        //* Then
        assert!(matches!(err, RpcError::RateLimited(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn rate_limit_message_is_retryable() {
        //* When
        let err = RpcError::from(error_resp(-32000, "Too Many Requests, slow down"));

        //* Then
        assert!(err.is_retryable());
    }

    #[test]
    fn other_error_responses_are_permanent() {
        //* When
        let err = RpcError::from(error_resp(-32602, "invalid params"));

        //* Then
        assert!(matches!(err, RpcError::Response { code: -32602, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn http_429_is_rate_limited() {
        //* Given
        let err = TransportErrorKind::http_error(429, "slow down".to_string());

        //* When
        let err = RpcError::from(err);

        //* Then
        assert!(matches!(err, RpcError::RateLimited(ref body) if body == "slow down"));
    }

    #[test]
    fn other_http_statuses_are_transient() {
        //* When
        let err = RpcError::from(TransportErrorKind::http_error(502, "bad gateway".to_string()));

        //* Then
        assert!(matches!(err, RpcError::Transport(_)));
        assert!(err.is_retryable());
    }
}
