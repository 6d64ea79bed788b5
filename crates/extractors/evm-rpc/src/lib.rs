//! Fetching of chunk data from Ethereum JSON-RPC nodes.
//!
//! A [`Fetcher`] turns one [`Chunk`](common::Chunk) into the raw records of its datatype by
//! issuing the remote requests the datatype's [`FetchStrategy`] calls for. Requests go through
//! a shared [`Limits`] object (chunk and request semaphores plus an optional global rate
//! limiter) and are retried with exponential backoff. A chunk's outcome is all-or-nothing
//! unless `exclude_failed` is set.

pub mod client;
pub mod error;
pub mod fetcher;
pub mod limits;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod plan;
pub mod rpc;
pub mod strategy;
mod tables;

pub use client::JsonRpcClient;
pub use error::{ChunkFetchError, RpcError};
pub use fetcher::{DEFAULT_INNER_REQUEST_SIZE, FetchOptions, FetchOutcome, Fetcher, HeadResolver};
pub use limits::{FetchLimits, InvalidLimitsError, Limits, RetryPolicy};
pub use plan::{ChunkPlan, PlannedRequest};
pub use rpc::{LogFilter, RpcSource};
pub use strategy::{Call, FetchStrategy, Request, RequestShape};
