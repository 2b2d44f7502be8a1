#![allow(dead_code)]

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tiny_http::{Method, Response, Server, StatusCode};

use stx_send_adapters::KdfParams;
use stx_send_core::ModalDispatchPort;

pub const RECIPIENT: &str = "ST1040G2081040G2081040G2081040G209PGXK8S";
pub const PASSWORD: &str = "correct horse battery staple";

/// Cheap KDF settings so tests do not spend seconds in argon2.
pub fn fast_kdf() -> KdfParams {
    KdfParams {
        argon2_memory_kib: 64,
        argon2_iterations: 1,
        pbkdf2_rounds: 1_000,
    }
}

pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[derive(Clone, Default)]
pub struct CountingDispatch {
    pub closes: Arc<AtomicUsize>,
}

impl CountingDispatch {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ModalDispatchPort for CountingDispatch {
    fn close_tx_modal(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Mock Stacks node. Broadcasts of transactions whose amount byte is `0xff`
/// are rejected, `0xfe` hits a plain-text gateway error; everything else is
/// accepted with a fixed txid.
pub fn spawn_mock_node(
    calls: Arc<Mutex<Vec<RecordedRequest>>>,
) -> (String, thread::JoinHandle<()>) {
    let server = Server::http("127.0.0.1:0").expect("start server");
    let addr = format!("http://{}", server.server_addr());

    let join = thread::spawn(move || {
        for _ in 0..16 {
            let mut req = match server.recv() {
                Ok(r) => r,
                Err(_) => break,
            };
            let method = req.method().clone();
            let path = req.url().to_owned();
            let content_type = req
                .headers()
                .iter()
                .find(|h| h.field.equiv("Content-Type"))
                .map(|h| h.value.as_str().to_owned());
            let mut body = Vec::new();
            let _ = req.as_reader().read_to_end(&mut body);
            let amount_byte = body.len().checked_sub(35).map(|i| body[i]);
            let rejected = amount_byte == Some(0xff);
            let gateway_down = amount_byte == Some(0xfe);
            let posting = method == Method::Post;
            if let Ok(mut g) = calls.lock() {
                g.push(RecordedRequest {
                    method: method.to_string(),
                    path: path.clone(),
                    content_type,
                    body,
                });
            }

            if posting && gateway_down && path == "/v2/transactions" {
                let response = Response::from_string("Bad Gateway").with_status_code(StatusCode(502));
                let _ = req.respond(response);
                continue;
            }

            let (code, payload): (u16, Value) = match (method, path.as_str()) {
                (Method::Get, p) if p.starts_with("/v2/accounts/") && p.ends_with("?proof=0") => (
                    200,
                    json!({
                        "balance": "0x000000000000000000000000004c4b40",
                        "locked": "0x00000000000000000000000000000000",
                        "nonce": 7
                    }),
                ),
                (Method::Get, "/v2/fees/transfer") => (200, json!(2)),
                (Method::Post, "/v2/transactions") if rejected => (
                    400,
                    json!({
                        "error": "transaction rejected",
                        "reason": "NotEnoughFunds",
                        "txid": "00"
                    }),
                ),
                (Method::Post, "/v2/transactions") => (
                    200,
                    json!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
                ),
                _ => (404, json!({"error": "not found"})),
            };

            let response =
                Response::from_string(payload.to_string()).with_status_code(StatusCode(code));
            let _ = req.respond(response);
        }
    });

    (addr, join)
}
