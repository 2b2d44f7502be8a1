use std::fmt;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::address::StacksAddress;
use crate::amount::{stx_to_micro_stx, to_human_readable_stx};
use crate::domain::{BroadcastReceipt, TransactionDraft, TransferParams, TxModalStep, WalletContext};
use crate::ports::{
    BroadcastPort, HardwareSignerPort, KeyVaultPort, ModalDispatchPort, PortError,
    TransactionBuilderPort,
};
use crate::state_machine::{modal_transition, ModalAction, StateTransition};
use crate::transaction::SignedTransaction;

pub const DECRYPTION_FAILED: &str = "Unable to decrypt wallet with this password";

#[derive(Debug, Clone)]
pub enum SendCommand {
    SubmitDescribe { recipient: String, amount: String },
    GoBack,
    ProceedToSign,
    SendWithPassword { password: String },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormField {
    Recipient,
    Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: FormField,
    pub message: String,
}

impl FieldError {
    fn new(field: FormField, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.field, self.message)
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid form: {}", join_errors(.0))]
    InvalidForm(Vec<FieldError>),
    #[error("insufficient balance: total {total} exceeds balance {balance}")]
    InsufficientBalance { total: u64, balance: u64 },
    #[error("password or key material missing")]
    MissingKeyMaterial,
    #[error("{0}")]
    Decryption(&'static str),
    #[error("broadcast failed: {0}")]
    Broadcast(PortError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("illegal transition: {from:?} + {action:?}")]
    IllegalTransition { from: TxModalStep, action: ModalAction },
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub transition: Option<StateTransition>,
    pub receipt: Option<BroadcastReceipt>,
}

impl CommandResult {
    fn transitioned(transition: StateTransition) -> Self {
        Self {
            transition: Some(transition),
            receipt: None,
        }
    }
}

/// Modal state owned by the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModalState {
    pub step: TxModalStep,
    pub draft: Option<TransactionDraft>,
    pub has_submitted: bool,
    pub decryption_error: Option<String>,
    pub broadcast_error: Option<String>,
}

impl Default for ModalState {
    fn default() -> Self {
        Self {
            step: TxModalStep::DescribeTx,
            draft: None,
            has_submitted: false,
            decryption_error: None,
            broadcast_error: None,
        }
    }
}

/// Drives the send modal from describe to broadcast.
pub struct SendFlow<V, B, N, D>
where
    V: KeyVaultPort,
    B: TransactionBuilderPort,
    N: BroadcastPort,
    D: ModalDispatchPort,
{
    pub vault: V,
    pub builder: B,
    pub broadcaster: N,
    pub dispatch: D,
    context: WalletContext,
    state: ModalState,
}

impl<V, B, N, D> SendFlow<V, B, N, D>
where
    V: KeyVaultPort,
    B: TransactionBuilderPort,
    N: BroadcastPort,
    D: ModalDispatchPort,
{
    pub fn new(vault: V, builder: B, broadcaster: N, dispatch: D, context: WalletContext) -> Self {
        Self {
            vault,
            builder,
            broadcaster,
            dispatch,
            context,
            state: ModalState::default(),
        }
    }

    pub fn state(&self) -> &ModalState {
        &self.state
    }

    pub fn context(&self) -> &WalletContext {
        &self.context
    }

    /// Replaces balance, nonce and key material after an account refresh.
    pub fn set_context(&mut self, context: WalletContext) {
        self.context = context;
    }

    pub async fn handle(&mut self, command: SendCommand) -> Result<CommandResult, SendError> {
        match command {
            SendCommand::SubmitDescribe { recipient, amount } => {
                self.submit_describe(&recipient, &amount)
            }
            SendCommand::GoBack => Ok(CommandResult::transitioned(
                self.transition(ModalAction::GoBack)?,
            )),
            SendCommand::ProceedToSign => self.proceed_to_sign(),
            SendCommand::SendWithPassword { password } => self.send_with_password(&password).await,
            SendCommand::Close => {
                let transition = self.close();
                Ok(CommandResult::transitioned(transition))
            }
        }
    }

    /// Hardware path: confirm the address on the device, have it sign, broadcast.
    pub async fn sign_with_ledger<H: HardwareSignerPort>(
        &mut self,
        signer: &H,
    ) -> Result<CommandResult, SendError> {
        self.require_step(TxModalStep::SignWithLedgerAndSend, ModalAction::ProceedLedger)?;
        self.state.has_submitted = true;
        let draft = self.current_draft()?;

        let confirmed = signer.confirm_public_key().await.inspect_err(|e| {
            warn!(error = %e, "ledger address confirmation failed");
        })?;
        debug!(address = %confirmed.address, "ledger confirmed sender");

        let params = self.transfer_params(&draft);
        let mut tx = self
            .builder
            .make_unsigned_transfer(&params, &confirmed.public_key)?;
        let signature = signer
            .sign_transaction(tx.serialize())
            .await
            .inspect_err(|e| warn!(error = %e, "ledger signing failed"))?;
        tx.set_signature(signature);

        let signed = SignedTransaction::new(tx)?;
        self.broadcast(signed, draft.amount).await
    }

    fn submit_describe(&mut self, recipient: &str, amount: &str) -> Result<CommandResult, SendError> {
        self.require_step(TxModalStep::DescribeTx, ModalAction::PreviewReady)?;
        let (recipient, amount) = self.validate_form(recipient, amount)?;

        let fee = self.builder.estimate_fee(&TransferParams {
            network: self.context.network,
            recipient,
            amount,
            nonce: self.context.nonce,
            fee: None,
            memo: String::new(),
        })?;
        let draft = TransactionDraft::new(recipient, amount, fee)?;
        debug!(
            %recipient,
            amount = %to_human_readable_stx(draft.amount),
            fee = %to_human_readable_stx(draft.fee),
            "draft ready"
        );
        self.state.draft = Some(draft);
        Ok(CommandResult::transitioned(
            self.transition(ModalAction::PreviewReady)?,
        ))
    }

    /// Checks every form rule and reports all failures together.
    pub fn validate_form(
        &self,
        recipient: &str,
        amount: &str,
    ) -> Result<(StacksAddress, u64), SendError> {
        let mut errors = Vec::new();

        let recipient = match recipient.parse::<StacksAddress>() {
            Err(_) => {
                errors.push(FieldError::new(
                    FormField::Recipient,
                    "Must be a valid Stacks Address",
                ));
                None
            }
            Ok(address) if !address.is_for_network(self.context.network) => {
                errors.push(FieldError::new(
                    FormField::Recipient,
                    "Address is for incorrect network",
                ));
                None
            }
            Ok(address) if address == self.context.sender => {
                errors.push(FieldError::new(
                    FormField::Recipient,
                    "You cannot send Stacks to yourself",
                ));
                None
            }
            Ok(address) => Some(address),
        };

        let amount = match stx_to_micro_stx(amount) {
            Err(e) => {
                errors.push(FieldError::new(FormField::Amount, e.to_string()));
                None
            }
            Ok(micro) if micro > self.context.balance => {
                errors.push(FieldError::new(
                    FormField::Amount,
                    "Cannot send more STX than available balance",
                ));
                None
            }
            Ok(micro) => Some(micro),
        };

        match (recipient, amount) {
            (Some(recipient), Some(amount)) if errors.is_empty() => Ok((recipient, amount)),
            _ => {
                debug!(errors = %join_errors(&errors), "describe form rejected");
                Err(SendError::InvalidForm(errors))
            }
        }
    }

    fn proceed_to_sign(&mut self) -> Result<CommandResult, SendError> {
        let action = ModalAction::proceed_for(self.context.wallet_type);
        self.require_step(TxModalStep::PreviewTx, action)?;
        let draft = self.current_draft()?;
        if draft.total > self.context.balance {
            return Err(SendError::InsufficientBalance {
                total: draft.total,
                balance: self.context.balance,
            });
        }
        Ok(CommandResult::transitioned(self.transition(action)?))
    }

    async fn send_with_password(&mut self, password: &str) -> Result<CommandResult, SendError> {
        self.require_step(TxModalStep::DecryptWalletAndSend, ModalAction::ProceedSoftware)?;
        self.state.has_submitted = true;
        self.state.decryption_error = None;

        let wallet = match &self.context.encrypted_wallet {
            Some(wallet) if !password.is_empty() => wallet.clone(),
            _ => return Err(SendError::MissingKeyMaterial),
        };
        let draft = self.current_draft()?;

        let key = match self.vault.decrypt_software_wallet(&wallet, password) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "wallet decryption failed");
                self.state.decryption_error = Some(DECRYPTION_FAILED.to_owned());
                return Err(SendError::Decryption(DECRYPTION_FAILED));
            }
        };

        let params = self.transfer_params(&draft);
        let signed = self.builder.make_signed_transfer(&params, &key)?;
        self.broadcast(signed, draft.amount).await
    }

    async fn broadcast(
        &mut self,
        signed: SignedTransaction,
        amount: u64,
    ) -> Result<CommandResult, SendError> {
        self.state.broadcast_error = None;
        match self.broadcaster.broadcast(signed, amount).await {
            Ok(receipt) => {
                info!(
                    txid = %receipt.txid,
                    amount = %to_human_readable_stx(receipt.amount),
                    fee = %to_human_readable_stx(receipt.fee),
                    "transaction broadcast"
                );
                let transition = self.close();
                Ok(CommandResult {
                    transition: Some(transition),
                    receipt: Some(receipt),
                })
            }
            Err(e) => {
                error!(error = %e, "broadcast failed");
                self.state.broadcast_error = Some(e.to_string());
                Err(SendError::Broadcast(e))
            }
        }
    }

    fn close(&mut self) -> StateTransition {
        let from = self.state.step;
        self.dispatch.close_tx_modal();
        self.state = ModalState::default();
        StateTransition {
            from,
            to: TxModalStep::DescribeTx,
            reason: "reset",
        }
    }

    // Fee is left for the builder to re-estimate against the real transaction.
    fn transfer_params(&self, draft: &TransactionDraft) -> TransferParams {
        TransferParams {
            network: self.context.network,
            recipient: draft.recipient,
            amount: draft.amount,
            nonce: self.context.nonce,
            fee: None,
            memo: String::new(),
        }
    }

    fn current_draft(&self) -> Result<TransactionDraft, SendError> {
        self.state
            .draft
            .clone()
            .ok_or_else(|| PortError::Validation("no transaction draft".to_owned()).into())
    }

    fn require_step(&self, expected: TxModalStep, action: ModalAction) -> Result<(), SendError> {
        if self.state.step != expected {
            return Err(SendError::IllegalTransition {
                from: self.state.step,
                action,
            });
        }
        Ok(())
    }

    fn transition(&mut self, action: ModalAction) -> Result<StateTransition, SendError> {
        let from = self.state.step;
        let (to, transition) = modal_transition(from, action)
            .map_err(|_| SendError::IllegalTransition { from, action })?;
        debug!(?from, ?to, reason = transition.reason, "modal step");
        self.state.step = to;
        Ok(transition)
    }
}
