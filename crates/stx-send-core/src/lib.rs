pub mod address;
pub mod amount;
pub mod app;
pub mod domain;
pub mod orchestrator;
pub mod ports;
pub mod session;
pub mod state_machine;
pub mod transaction;

pub use address::{Network, StacksAddress};
pub use domain::{ConnectionStep, TransactionDraft, TxModalStep, WalletContext, WalletType};
pub use orchestrator::{CommandResult, SendCommand, SendError, SendFlow};
pub use ports::{
    BroadcastPort, DeviceChannel, DeviceTransportPort, HardwareSignerPort, KeyVaultPort,
    ModalDispatchPort, PortError, TransactionBuilderPort,
};
pub use session::{DeviceSession, DeviceSessionHandle, SessionConfig, SessionError};
pub use state_machine::{ModalAction, StateTransition};
pub use transaction::{SignedTransaction, StacksTransaction};
