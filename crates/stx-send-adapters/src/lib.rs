pub mod config;
pub mod crypto;
pub mod emulator;
pub mod node;
pub mod tx_builder;
pub mod wallet_file;

pub use config::{RuntimeProfile, SendFlowConfig};
pub use crypto::{KdfParams, SoftwareKeyVault};
pub use emulator::{EmulatedLedger, EmulatorCounters};
pub use node::{AccountInfo, NodeClient, RecordedBroadcast};
pub use tx_builder::StacksTransactionBuilder;
pub use wallet_file::WalletFile;
