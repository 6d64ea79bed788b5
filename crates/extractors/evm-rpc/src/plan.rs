//! Request plans for dry runs.

use common::Chunk;
use datasets_raw::TableSchema;
use serde::Serialize;

use crate::{
    fetcher::Fetcher,
    rpc::RpcSource,
    strategy::{self, FetchStrategy, Request, RequestShape},
};

/// The requests a chunk would issue, without issuing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkPlan {
    pub sequence_index: usize,
    pub label: String,
    pub n_units: u64,
    pub requests: Vec<PlannedRequest>,
}

impl ChunkPlan {
    /// Requests whose count is known before fetching.
    pub fn known_requests(&self) -> u64 {
        self.requests.iter().filter_map(|r| r.count).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRequest {
    pub method: &'static str,
    /// Unknown for per-item requests, which depend on the fetched data
    pub count: Option<u64>,
    /// Method re-issued per item when this request fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<&'static str>,
}

impl<S: RpcSource> Fetcher<S> {
    pub fn plan(&self, chunk: &Chunk, table: &TableSchema) -> ChunkPlan {
        let count = |request: Request| match request.shape {
            RequestShape::PerChunk => Some(self.log_filters(chunk).len() as u64),
            RequestShape::PerUnit => Some(chunk.n_units()),
            RequestShape::PerItem => None,
        };

        let requests = strategy::steps(chunk, table, self.options().receipts_per_tx)
            .into_iter()
            .map(|step| match step {
                FetchStrategy::Direct(request) => PlannedRequest {
                    method: request.call.method(),
                    count: count(request),
                    fallback: None,
                },
                FetchStrategy::Fallback { primary, secondary } => PlannedRequest {
                    method: primary.call.method(),
                    count: count(primary),
                    fallback: Some(secondary.call.method()),
                },
            })
            .collect();

        ChunkPlan {
            sequence_index: chunk.sequence_index,
            label: chunk.label(),
            n_units: chunk.n_units(),
            requests,
        }
    }
}
