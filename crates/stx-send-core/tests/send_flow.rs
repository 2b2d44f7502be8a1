mod common;

use common::{
    address, settle, wallet_context, CountingDispatch, FakeBuilder, FakeTransport, FakeVault,
    RecordingBroadcaster, DEVICE_PUBLIC_KEY, DEVICE_SIGNATURE, ESTIMATED_FEE, MAINNET_RECIPIENT,
    PASSWORD, RECIPIENT, SENDER, SOFTWARE_SIGNATURE,
};
use stx_send_core::orchestrator::{FormField, DECRYPTION_FAILED};
use stx_send_core::{
    ConnectionStep, DeviceSession, SendCommand, SendError, SendFlow, SessionConfig, TxModalStep,
    WalletType,
};

type TestFlow = SendFlow<FakeVault, FakeBuilder, RecordingBroadcaster, CountingDispatch>;

const BALANCE: u64 = 10_000_000;

fn new_flow(wallet_type: WalletType, broadcaster: RecordingBroadcaster) -> (TestFlow, CountingDispatch) {
    let dispatch = CountingDispatch::default();
    let flow = SendFlow::new(
        FakeVault,
        FakeBuilder,
        broadcaster,
        dispatch.clone(),
        wallet_context(wallet_type, BALANCE),
    );
    (flow, dispatch)
}

async fn describe(flow: &mut TestFlow, recipient: &str, amount: &str) -> Result<(), SendError> {
    flow.handle(SendCommand::SubmitDescribe {
        recipient: recipient.to_owned(),
        amount: amount.to_owned(),
    })
    .await
    .map(|_| ())
}

fn field_messages(err: SendError) -> Vec<(FormField, String)> {
    match err {
        SendError::InvalidForm(errors) => errors.into_iter().map(|e| (e.field, e.message)).collect(),
        other => panic!("expected form errors, got {other}"),
    }
}

#[tokio::test]
async fn describe_records_draft_with_estimated_fee() {
    let (mut flow, _) = new_flow(WalletType::Software, RecordingBroadcaster::default());
    let result = flow
        .handle(SendCommand::SubmitDescribe {
            recipient: RECIPIENT.to_owned(),
            amount: "1.5".to_owned(),
        })
        .await
        .expect("describe");

    let transition = result.transition.expect("transition");
    assert_eq!(transition.to, TxModalStep::PreviewTx);
    let draft = flow.state().draft.clone().expect("draft");
    assert_eq!(draft.recipient, address(RECIPIENT));
    assert_eq!(draft.amount, 1_500_000);
    assert_eq!(draft.fee, ESTIMATED_FEE);
    assert_eq!(draft.total, 1_500_000 + ESTIMATED_FEE);
}

#[tokio::test]
async fn invalid_recipients_are_reported() {
    let (mut flow, _) = new_flow(WalletType::Software, RecordingBroadcaster::default());

    let err = describe(&mut flow, "not-an-address", "1").await.expect_err("invalid");
    assert_eq!(
        field_messages(err),
        vec![(FormField::Recipient, "Must be a valid Stacks Address".to_owned())]
    );

    let err = describe(&mut flow, MAINNET_RECIPIENT, "1").await.expect_err("network");
    assert_eq!(
        field_messages(err),
        vec![(FormField::Recipient, "Address is for incorrect network".to_owned())]
    );

    let err = describe(&mut flow, SENDER, "1").await.expect_err("self");
    assert_eq!(
        field_messages(err),
        vec![(FormField::Recipient, "You cannot send Stacks to yourself".to_owned())]
    );
    assert_eq!(flow.state().step, TxModalStep::DescribeTx);
    assert!(flow.state().draft.is_none());
}

#[tokio::test]
async fn invalid_amounts_are_reported() {
    let (mut flow, _) = new_flow(WalletType::Software, RecordingBroadcaster::default());
    let cases = [
        ("abc", "Amount of STX must be described as number"),
        ("-1", "You cannot send a negative amount of STX"),
        ("0", "You cannot send a negative amount of STX"),
        ("0.0000001", "STX do not have more than 6 decimal places"),
        ("10.000001", "Cannot send more STX than available balance"),
    ];
    for (amount, message) in cases {
        let err = describe(&mut flow, RECIPIENT, amount).await.expect_err(amount);
        assert_eq!(
            field_messages(err),
            vec![(FormField::Amount, message.to_owned())],
            "amount {amount}"
        );
    }
    assert_eq!(flow.state().step, TxModalStep::DescribeTx);
}

#[tokio::test]
async fn both_fields_fail_together() {
    let (mut flow, _) = new_flow(WalletType::Software, RecordingBroadcaster::default());
    let err = describe(&mut flow, "", "").await.expect_err("empty form");
    let fields: Vec<FormField> = field_messages(err).into_iter().map(|(f, _)| f).collect();
    assert_eq!(fields, vec![FormField::Recipient, FormField::Amount]);
}

#[tokio::test]
async fn whole_balance_cannot_cover_fee() {
    let (mut flow, dispatch) = new_flow(WalletType::Software, RecordingBroadcaster::default());
    describe(&mut flow, RECIPIENT, "10").await.expect("amount equals balance");

    let err = flow
        .handle(SendCommand::ProceedToSign)
        .await
        .expect_err("fee pushes total over balance");
    assert!(matches!(
        err,
        SendError::InsufficientBalance { total, balance } if total == BALANCE + ESTIMATED_FEE && balance == BALANCE
    ));
    assert_eq!(flow.state().step, TxModalStep::PreviewTx);
    assert_eq!(dispatch.closes(), 0);
}

#[tokio::test]
async fn go_back_keeps_draft() {
    let (mut flow, _) = new_flow(WalletType::Software, RecordingBroadcaster::default());
    describe(&mut flow, RECIPIENT, "2").await.expect("describe");
    flow.handle(SendCommand::ProceedToSign).await.expect("proceed");
    assert_eq!(flow.state().step, TxModalStep::DecryptWalletAndSend);

    flow.handle(SendCommand::GoBack).await.expect("back to preview");
    flow.handle(SendCommand::GoBack).await.expect("back to describe");
    assert_eq!(flow.state().step, TxModalStep::DescribeTx);
    assert_eq!(flow.state().draft.as_ref().map(|d| d.amount), Some(2_000_000));

    let err = flow.handle(SendCommand::GoBack).await.expect_err("nothing behind describe");
    assert!(matches!(err, SendError::IllegalTransition { .. }));
}

#[tokio::test]
async fn software_happy_path_broadcasts_once_and_closes() {
    let broadcaster = RecordingBroadcaster::default();
    let (mut flow, dispatch) = new_flow(WalletType::Software, broadcaster.clone());

    describe(&mut flow, RECIPIENT, "1.5").await.expect("describe");
    flow.handle(SendCommand::ProceedToSign).await.expect("proceed");
    let result = flow
        .handle(SendCommand::SendWithPassword {
            password: PASSWORD.to_owned(),
        })
        .await
        .expect("send");

    let receipt = result.receipt.expect("receipt");
    assert_eq!(receipt.amount, 1_500_000);
    assert_eq!(receipt.fee, ESTIMATED_FEE);
    assert_eq!(receipt.total, receipt.amount + receipt.fee);

    let sent = broadcaster.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.recipient, address(RECIPIENT));
    assert_eq!(sent[0].payload.amount, 1_500_000);
    assert_eq!(sent[0].spending_condition.nonce, 4);
    assert_eq!(sent[0].spending_condition.signature.0, SOFTWARE_SIGNATURE);
    assert_eq!(receipt.txid, sent[0].txid_hex());

    assert_eq!(dispatch.closes(), 1);
    assert_eq!(flow.state().step, TxModalStep::DescribeTx);
    assert!(flow.state().draft.is_none());
}

#[tokio::test]
async fn wrong_password_sets_generic_error_without_broadcast() {
    let broadcaster = RecordingBroadcaster::default();
    let (mut flow, dispatch) = new_flow(WalletType::Software, broadcaster.clone());
    describe(&mut flow, RECIPIENT, "1").await.expect("describe");
    flow.handle(SendCommand::ProceedToSign).await.expect("proceed");

    let err = flow
        .handle(SendCommand::SendWithPassword {
            password: "wrong".to_owned(),
        })
        .await
        .expect_err("bad password");
    assert!(matches!(err, SendError::Decryption(DECRYPTION_FAILED)));
    assert_eq!(flow.state().decryption_error.as_deref(), Some(DECRYPTION_FAILED));
    assert!(flow.state().has_submitted);
    assert_eq!(flow.state().step, TxModalStep::DecryptWalletAndSend);
    assert!(broadcaster.sent().is_empty());
    assert_eq!(dispatch.closes(), 0);

    let err = flow
        .handle(SendCommand::SendWithPassword {
            password: String::new(),
        })
        .await
        .expect_err("empty password");
    assert!(matches!(err, SendError::MissingKeyMaterial));
}

#[tokio::test]
async fn broadcast_failure_is_recorded_and_not_retried() {
    let broadcaster = RecordingBroadcaster::failing("node unreachable");
    let (mut flow, dispatch) = new_flow(WalletType::Software, broadcaster.clone());
    describe(&mut flow, RECIPIENT, "1").await.expect("describe");
    flow.handle(SendCommand::ProceedToSign).await.expect("proceed");

    let err = flow
        .handle(SendCommand::SendWithPassword {
            password: PASSWORD.to_owned(),
        })
        .await
        .expect_err("broadcast fails");
    assert!(matches!(err, SendError::Broadcast(_)));
    assert!(flow
        .state()
        .broadcast_error
        .as_deref()
        .is_some_and(|e| e.contains("node unreachable")));
    assert_eq!(flow.state().step, TxModalStep::DecryptWalletAndSend);
    assert_eq!(dispatch.closes(), 0);
}

#[tokio::test]
async fn close_resets_flow() {
    let (mut flow, dispatch) = new_flow(WalletType::Software, RecordingBroadcaster::default());
    describe(&mut flow, RECIPIENT, "1").await.expect("describe");
    flow.handle(SendCommand::Close).await.expect("close");
    assert_eq!(dispatch.closes(), 1);
    assert_eq!(flow.state().step, TxModalStep::DescribeTx);
    assert!(flow.state().draft.is_none());
}

#[tokio::test]
async fn software_command_is_refused_on_ledger_path() {
    let (mut flow, _) = new_flow(WalletType::Ledger, RecordingBroadcaster::default());
    describe(&mut flow, RECIPIENT, "1").await.expect("describe");
    flow.handle(SendCommand::ProceedToSign).await.expect("proceed");
    assert_eq!(flow.state().step, TxModalStep::SignWithLedgerAndSend);

    let err = flow
        .handle(SendCommand::SendWithPassword {
            password: PASSWORD.to_owned(),
        })
        .await
        .expect_err("wrong path");
    assert!(matches!(err, SendError::IllegalTransition { .. }));
}

#[tokio::test(start_paused = true)]
async fn ledger_happy_path_embeds_device_signature() {
    let transport = FakeTransport::default();
    transport.set_app_open(true);
    let session = DeviceSession::spawn(transport.clone(), SessionConfig::default()).expect("spawn");
    let handle = session.handle();
    transport.attach("ledger-1");
    settle().await;

    let broadcaster = RecordingBroadcaster::default();
    let (mut flow, dispatch) = new_flow(WalletType::Ledger, broadcaster.clone());
    describe(&mut flow, RECIPIENT, "0.25").await.expect("describe");
    flow.handle(SendCommand::ProceedToSign).await.expect("proceed");

    let result = flow.sign_with_ledger(&handle).await.expect("ledger send");
    assert_eq!(handle.step(), ConnectionStep::HasAddress);

    let sent = broadcaster.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].spending_condition.signature.0, DEVICE_SIGNATURE);
    assert_eq!(&sent[0].spending_condition.signer[..], &DEVICE_PUBLIC_KEY[..20]);
    assert_eq!(result.receipt.expect("receipt").amount, 250_000);
    assert_eq!(transport.sign_requests(), 1);
    assert_eq!(dispatch.closes(), 1);
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ledger_rejection_aborts_without_broadcast() {
    let transport = FakeTransport::default();
    transport.set_app_open(true);
    transport.reject_next_sign();
    let session = DeviceSession::spawn(transport.clone(), SessionConfig::default()).expect("spawn");
    let handle = session.handle();
    transport.attach("ledger-1");
    settle().await;

    let broadcaster = RecordingBroadcaster::default();
    let (mut flow, dispatch) = new_flow(WalletType::Ledger, broadcaster.clone());
    describe(&mut flow, RECIPIENT, "0.25").await.expect("describe");
    flow.handle(SendCommand::ProceedToSign).await.expect("proceed");

    let err = flow.sign_with_ledger(&handle).await.expect_err("rejected on device");
    assert!(err.to_string().contains("Transaction rejected"));
    assert!(broadcaster.sent().is_empty());
    assert_eq!(dispatch.closes(), 0);
    assert_eq!(flow.state().step, TxModalStep::SignWithLedgerAndSend);
    session.shutdown().await;
}
