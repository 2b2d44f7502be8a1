//! stx-send: send STX from a software wallet or a Ledger.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use tracing::{info, warn};

use stx_send_adapters::crypto::sender_key_from_bytes;
use stx_send_adapters::tx_builder::{address_for, public_key_of};
use stx_send_adapters::{
    AccountInfo, EmulatedLedger, NodeClient, SendFlowConfig, SoftwareKeyVault,
    StacksTransactionBuilder, WalletFile,
};
use stx_send_core::amount::to_human_readable_stx;
use stx_send_core::domain::BroadcastReceipt;
use stx_send_core::orchestrator::FieldError;
use stx_send_core::{
    ConnectionStep, DeviceSession, DeviceSessionHandle, Network, SendCommand, SendError, SendFlow,
    StacksAddress, TxModalStep, WalletContext, WalletType,
};

mod terminal;

use terminal::TerminalDispatch;

const PASSWORD_ATTEMPTS: usize = 3;
const LEDGER_READY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(author, version, about = "Send STX from a software wallet or a Ledger")]
struct Cli {
    /// Wallet description file.
    #[arg(short, long, env = "STX_SEND_WALLET", default_value = "stx-wallet.json")]
    wallet: PathBuf,

    /// Overrides STX_SEND_NETWORK.
    #[arg(long)]
    network: Option<Network>,

    /// Overrides STX_SEND_NODE_URL.
    #[arg(long)]
    node_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a wallet file.
    InitWallet {
        /// Use the Ledger instead of a password-protected key.
        #[arg(long, default_value_t = false)]
        ledger: bool,
        /// Replace an existing wallet file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Print the wallet address, balance and nonce.
    Account {
        #[command(flatten)]
        offline: OfflineAccount,
    },
    /// Send STX to a recipient.
    Send {
        #[arg(long)]
        to: String,
        /// Amount in STX, e.g. `1.5`.
        #[arg(long)]
        amount: String,
        /// Skip the preview confirmation.
        #[arg(long, default_value_t = false)]
        yes: bool,
        #[command(flatten)]
        offline: OfflineAccount,
    },
}

/// Account state reported when no node URL is configured.
#[derive(clap::Args, Debug, Clone, Copy)]
struct OfflineAccount {
    /// Balance in µSTX.
    #[arg(long, default_value_t = 0)]
    balance: u64,
    #[arg(long, default_value_t = 0)]
    nonce: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SendFlowConfig::from_env();
    if let Some(network) = cli.network {
        config.network = network;
    }
    if let Some(url) = cli.node_url.as_deref() {
        config.node_url = Some(url.trim_end_matches('/').to_owned());
    }

    match cli.command {
        Command::InitWallet { ledger, force } => init_wallet(&config, &cli.wallet, ledger, force).await,
        Command::Account { offline } => show_account(&config, &cli.wallet, offline).await,
        Command::Send {
            to,
            amount,
            yes,
            offline,
        } => send(&config, &cli.wallet, &to, &amount, yes, offline).await,
    }
}

async fn init_wallet(config: &SendFlowConfig, path: &Path, ledger: bool, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(eyre!(
            "{} already exists, pass --force to replace it",
            path.display()
        ));
    }

    let file = if ledger {
        let device = emulated_device(config, config.network)?;
        let session = DeviceSession::spawn(device, config.session_config()?)?;
        let handle = session.handle();
        let confirmed = async {
            wait_for_ledger(&handle).await?;
            Ok::<_, eyre::Report>(handle.confirm_address().await?)
        }
        .await;
        session.shutdown().await;
        let address: StacksAddress = confirmed?
            .address
            .parse()
            .wrap_err("device returned an invalid address")?;
        WalletFile::ledger(config.network, &address)
    } else {
        let raw = terminal::prompt_password("Private key (hex): ")?;
        let bytes = alloy::hex::decode(raw.trim()).wrap_err("private key is not hex")?;
        let key = sender_key_from_bytes(&bytes)?;
        let address = address_for(config.network, &public_key_of(&key)?)?;
        let password = terminal::prompt_new_password()?;
        let encrypted = SoftwareKeyVault::new(config.kdf).encrypt_key(&key, &password)?;
        WalletFile::software(config.network, &address, &encrypted)
    };

    file.save(path)?;
    info!(path = %path.display(), address = %file.address, "wallet written");
    println!("{}", file.address);
    Ok(())
}

async fn show_account(config: &SendFlowConfig, path: &Path, offline: OfflineAccount) -> Result<()> {
    let file = load_wallet(config, path)?;
    let sender = file.sender()?;
    let node = node_client(config, offline)?;
    let account = node.fetch_account(&sender).await?;
    println!("Address  {sender}");
    println!("Type     {:?}", file.wallet_type);
    println!("Balance  {}", to_human_readable_stx(account.balance));
    println!("Nonce    {}", account.nonce);
    Ok(())
}

async fn send(
    config: &SendFlowConfig,
    path: &Path,
    recipient: &str,
    amount: &str,
    yes: bool,
    offline: OfflineAccount,
) -> Result<()> {
    let file = load_wallet(config, path)?;
    let sender = file.sender()?;
    // Refuse before any prompt when the device cannot be used here.
    let device = match file.wallet_type {
        WalletType::Ledger => Some(emulated_device(config, file.network)?),
        WalletType::Software => None,
    };
    let node = node_client(config, offline)?;
    let account = node.fetch_account(&sender).await?;
    let context = WalletContext {
        wallet_type: file.wallet_type,
        network: file.network,
        sender,
        balance: account.balance,
        nonce: account.nonce,
        encrypted_wallet: file.encrypted_wallet()?,
    };

    let fee_rate = resolve_fee_rate(config, &node).await;
    let mut flow = SendFlow::new(
        SoftwareKeyVault::new(config.kdf),
        StacksTransactionBuilder::new(fee_rate),
        node,
        TerminalDispatch,
        context,
    );

    let described = flow
        .handle(SendCommand::SubmitDescribe {
            recipient: recipient.to_owned(),
            amount: amount.to_owned(),
        })
        .await;
    if let Err(SendError::InvalidForm(errors)) = &described {
        print_field_errors(errors);
    }
    described?;

    let Some(draft) = flow.state().draft.clone() else {
        return Err(eyre!("no transaction to preview"));
    };
    terminal::print_preview(&draft);
    if !yes && !terminal::confirm("Send this transaction?")? {
        flow.handle(SendCommand::Close).await?;
        return Ok(());
    }
    flow.handle(SendCommand::ProceedToSign).await?;

    let receipt = match flow.state().step {
        TxModalStep::DecryptWalletAndSend => send_with_password(&mut flow).await?,
        TxModalStep::SignWithLedgerAndSend => {
            let device = device.ok_or_else(|| eyre!("no device for ledger wallet"))?;
            let session = DeviceSession::spawn(device, config.session_config()?)?;
            let handle = session.handle();
            let result = async {
                wait_for_ledger(&handle).await?;
                println!("{}", terminal::connection_instructions(ConnectionStep::HasAddress));
                Ok::<_, eyre::Report>(flow.sign_with_ledger(&handle).await?)
            }
            .await;
            session.shutdown().await;
            result?.receipt
        }
        step => return Err(eyre!("unexpected step after preview: {step:?}")),
    };

    let receipt = receipt.ok_or_else(|| eyre!("broadcast returned no receipt"))?;
    print_receipt(&receipt);
    Ok(())
}

async fn send_with_password(
    flow: &mut SendFlow<SoftwareKeyVault, StacksTransactionBuilder, NodeClient, TerminalDispatch>,
) -> Result<Option<BroadcastReceipt>> {
    for attempt in 1..=PASSWORD_ATTEMPTS {
        let password = terminal::prompt_password("Wallet password: ")?;
        match flow.handle(SendCommand::SendWithPassword { password }).await {
            Ok(result) => return Ok(result.receipt),
            Err(SendError::Decryption(message)) if attempt < PASSWORD_ATTEMPTS => {
                println!("{message}");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(eyre!("too many failed password attempts"))
}

/// Waits until the Stacks app is open, printing what the user should do next.
async fn wait_for_ledger(handle: &DeviceSessionHandle) -> Result<()> {
    let mut steps = handle.steps();
    let ready = async {
        loop {
            let step = *steps.borrow_and_update();
            println!("{}", terminal::connection_instructions(step));
            if matches!(step, ConnectionStep::ConnectedAppOpen | ConnectionStep::HasAddress) {
                return Ok::<(), eyre::Report>(());
            }
            steps
                .changed()
                .await
                .map_err(|_| eyre!("device session ended"))?;
        }
    };
    tokio::time::timeout(LEDGER_READY_TIMEOUT, ready)
        .await
        .map_err(|_| eyre!("timed out waiting for the Ledger"))?
}

// No HID backend is linked; Ledger wallets talk to the in-process emulator,
// which is refused in production and on mainnet.
fn emulated_device(config: &SendFlowConfig, network: Network) -> Result<EmulatedLedger> {
    let device = EmulatedLedger::for_config(config, network)?;
    device.attach("emulator-0")?;
    device.open_app()?;
    Ok(device)
}

fn load_wallet(config: &SendFlowConfig, path: &Path) -> Result<WalletFile> {
    let file = WalletFile::load(path)?;
    if file.network != config.network {
        warn!(
            wallet = ?file.network,
            configured = ?config.network,
            "wallet network differs from configured network, using the wallet's"
        );
    }
    Ok(file)
}

fn node_client(config: &SendFlowConfig, offline: OfflineAccount) -> Result<NodeClient> {
    let node = NodeClient::with_config(config);
    if node.is_recording() {
        node.set_recorded_account(AccountInfo {
            balance: offline.balance,
            nonce: offline.nonce,
        })?;
    }
    Ok(node)
}

async fn resolve_fee_rate(config: &SendFlowConfig, node: &NodeClient) -> u64 {
    if node.is_recording() {
        return config.fee_rate;
    }
    match node.fetch_fee_rate().await {
        Ok(rate) => rate.max(config.fee_rate),
        Err(e) => {
            warn!(error = %e, fallback = config.fee_rate, "fee rate unavailable");
            config.fee_rate
        }
    }
}

fn print_field_errors(errors: &[FieldError]) {
    for error in errors {
        println!("{:?}: {}", error.field, error.message);
    }
}

fn print_receipt(receipt: &BroadcastReceipt) {
    println!("Broadcast {}", receipt.txid);
    println!(
        "Sent {} (fee {}, total {})",
        to_human_readable_stx(receipt.amount),
        to_human_readable_stx(receipt.fee),
        to_human_readable_stx(receipt.total)
    );
}
