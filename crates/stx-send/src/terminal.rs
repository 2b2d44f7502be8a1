use std::io::{self, BufRead, Write};

use eyre::{eyre, Result};
use stx_send_core::amount::to_human_readable_stx;
use stx_send_core::{ConnectionStep, ModalDispatchPort, TransactionDraft};

/// Stands in for the modal host: closing the modal just tells the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalDispatch;

impl ModalDispatchPort for TerminalDispatch {
    fn close_tx_modal(&self) {
        println!("Send dialog closed.");
    }
}

pub fn print_preview(draft: &TransactionDraft) {
    println!();
    println!("  Recipient  {}", draft.recipient);
    println!("  Amount     {}", to_human_readable_stx(draft.amount));
    println!("  Fee        {}", to_human_readable_stx(draft.fee));
    println!("  Total      {}", to_human_readable_stx(draft.total));
    println!();
}

pub fn connection_instructions(step: ConnectionStep) -> &'static str {
    match step {
        ConnectionStep::Disconnected => "Connect your Ledger and unlock it.",
        ConnectionStep::ConnectedAppClosed => "Open the Stacks app on your Ledger.",
        ConnectionStep::ConnectedAppOpen => "Ledger ready. Confirm the address on the device.",
        ConnectionStep::HasAddress => "Review and approve the transaction on your Ledger.",
    }
}

pub fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

pub fn prompt_password(prompt: &str) -> Result<String> {
    Ok(rpassword::prompt_password(prompt)?)
}

/// Asks twice and insists on a match.
pub fn prompt_new_password() -> Result<String> {
    let first = prompt_password("New wallet password: ")?;
    if first.is_empty() {
        return Err(eyre!("password must not be empty"));
    }
    let second = prompt_password("Repeat password: ")?;
    if first != second {
        return Err(eyre!("passwords do not match"));
    }
    Ok(first)
}
