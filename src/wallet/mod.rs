pub mod model;
pub mod script_hash;
pub mod sync;
pub mod types;

pub use model::{Balance, ScriptType, Wallet, WalletChanges};
pub use script_hash::{ScriptHash, all_script_hashes, node_script_hash};
pub use sync::{SharedWallet, WalletSyncService};
pub use types::*;
