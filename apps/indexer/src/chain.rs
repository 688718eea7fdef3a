use anyhow::Result;

/// The slice of a block header the scanner cares about. Hashes are lowercase
/// 0x-prefixed hex, as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
}

/// Capabilities required from the chain node. Implemented by the JSON-RPC
/// client and by the scripted chain used in tests.
pub trait ChainClient {
    fn latest_height(&self) -> impl Future<Output = Result<u64>> + Send;

    /// `None` when `block_number` is past the chain tip.
    fn header_at(
        &self,
        block_number: u64,
    ) -> impl Future<Output = Result<Option<BlockHeader>>> + Send;

    fn logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        address: &str,
    ) -> impl Future<Output = Result<Vec<alloy::rpc::types::Log>>> + Send;
}
