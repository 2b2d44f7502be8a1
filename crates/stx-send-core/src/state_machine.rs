use crate::app::return_code;
use crate::domain::{ConnectionStep, TxModalStep, WalletType};
use crate::ports::PortError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalAction {
    PreviewReady,
    GoBack,
    ProceedSoftware,
    ProceedLedger,
    Reset,
}

impl ModalAction {
    pub fn proceed_for(wallet_type: WalletType) -> Self {
        match wallet_type {
            WalletType::Software => Self::ProceedSoftware,
            WalletType::Ledger => Self::ProceedLedger,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: TxModalStep,
    pub to: TxModalStep,
    pub reason: &'static str,
}

pub fn modal_transition(
    step: TxModalStep,
    action: ModalAction,
) -> Result<(TxModalStep, StateTransition), PortError> {
    use ModalAction as A;
    use TxModalStep as S;

    let (to, reason) = match (step, action) {
        (_, A::Reset) => (S::DescribeTx, "reset"),
        (S::DescribeTx, A::PreviewReady) => (S::PreviewTx, "draft_ready"),
        (S::PreviewTx, A::GoBack) => (S::DescribeTx, "back_to_describe"),
        (S::PreviewTx, A::ProceedSoftware) => (S::DecryptWalletAndSend, "software_wallet"),
        (S::PreviewTx, A::ProceedLedger) => (S::SignWithLedgerAndSend, "ledger_wallet"),
        (S::DecryptWalletAndSend | S::SignWithLedgerAndSend, A::GoBack) => {
            (S::PreviewTx, "back_to_preview")
        }
        _ => {
            return Err(PortError::Validation(format!(
                "illegal modal transition: {step:?} + {action:?}"
            )))
        }
    };
    Ok((
        to,
        StateTransition {
            from: step,
            to,
            reason,
        },
    ))
}

/// Step implied by a version query's return code; `None` leaves the step alone.
pub fn connection_step_for_status(code: u16) -> Option<ConnectionStep> {
    match code {
        return_code::APP_NOT_OPEN => Some(ConnectionStep::ConnectedAppClosed),
        return_code::NO_ERROR => Some(ConnectionStep::ConnectedAppOpen),
        _ => None,
    }
}
