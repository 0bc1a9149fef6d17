use crate::{crypto::keys::SpendingKey, note::Erc20Note};

pub mod erc20;

/// An unspent note the wallet can spend: the note itself, its leaf
/// coordinates, and the derived key that owns it.
#[derive(Debug, Clone)]
pub struct SpendableNote {
    pub tree: u32,
    pub position: u32,
    pub spending_key: SpendingKey,
    pub note: Erc20Note,
}
