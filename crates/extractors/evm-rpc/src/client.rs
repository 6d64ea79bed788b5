use alloy::{
    primitives::{B256, U64},
    rpc::client::{ClientBuilder, RpcClient},
};
use common::BlockNum;
use url::Url;

use crate::{
    error::RpcError,
    rpc::{LogFilter, RpcBlock, RpcLog, RpcReceipt, RpcSource, RpcTransaction},
};

/// [`RpcSource`] backed by a JSON-RPC node over HTTP.
#[derive(Clone)]
pub struct JsonRpcClient {
    client: RpcClient,
}

impl JsonRpcClient {
    pub fn new(url: Url) -> Self {
        let client = ClientBuilder::default().http(url);
        Self { client }
    }
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient").finish_non_exhaustive()
    }
}

impl RpcSource for JsonRpcClient {
    async fn latest_block(&self) -> Result<BlockNum, RpcError> {
        let number: U64 = self.client.request_noparams("eth_blockNumber").await?;
        Ok(number.to::<u64>())
    }

    async fn block(&self, number: BlockNum, full: bool) -> Result<Option<RpcBlock>, RpcError> {
        let block = self
            .client
            .request("eth_getBlockByNumber", (U64::from(number), full))
            .await?;
        Ok(block)
    }

    async fn block_receipts(&self, number: BlockNum) -> Result<Option<Vec<RpcReceipt>>, RpcError> {
        let receipts = self
            .client
            .request("eth_getBlockReceipts", (U64::from(number),))
            .await?;
        Ok(receipts)
    }

    async fn transaction(&self, hash: B256) -> Result<Option<RpcTransaction>, RpcError> {
        let tx = self
            .client
            .request("eth_getTransactionByHash", (hash,))
            .await?;
        Ok(tx)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<RpcReceipt>, RpcError> {
        let receipt = self
            .client
            .request("eth_getTransactionReceipt", (hash,))
            .await?;
        Ok(receipt)
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, RpcError> {
        let logs = self
            .client
            .request("eth_getLogs", (filter.to_json(),))
            .await?;
        Ok(logs)
    }
}
