use alloy::primitives::{Address, ChainId, address};

/// Eip155 chain configuration for a shielded-pool deployment.
#[derive(Copy, Clone, Debug)]
pub struct ChainConfig {
    /// EIP-155 chain ID
    pub id: ChainId,
    /// Shielded-pool proxy contract on this chain
    pub proxy_contract: Address,
    /// Block the proxy was deployed at; historical replay starts here
    pub deployment_block: u64,
}

pub const MAINNET_CONFIG: ChainConfig = ChainConfig {
    id: 1,
    proxy_contract: address!("0xFA7093CDD9EE6932B4eb2c9e1cde7CE00B1FA4b9"),
    deployment_block: 12_696_000,
};
