// Copyright (c) 2024 Botho Foundation

//! Shared fixtures: envelope factories, scripted fakes for every remote role,
//! and a hyper stub server for tests that go over real HTTP.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use fuego_agent::{
    gateway::{
        BroadcastReceipt, BroadcastRequest, BuiltTransaction, PaymentRequest, TransferRequest,
    },
    AnchorSource, Authorizer, Broadcaster, GatewayError, KeypairSigner, ResourceClient,
    ResourceRequest, ResourceResponse, SignerHandle, TransactionBuilder,
};
use fuego_core::{
    decode, encode,
    envelope::{CompiledInstruction, LegacyMessage, MessageHeader, VersionedMessage},
    parse_amount, AgentConfig, Anchor, Asset, Identity, MessageBody, Network, RetryConfig,
    UnsignedEnvelope,
};
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Incoming, header::HeaderMap, server::conn::http1, service::service_fn, Method, Request,
    Response,
};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::{
    collections::VecDeque,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::net::TcpListener;

// ============================================================================
// Identities and envelopes
// ============================================================================

pub const STALE_ANCHOR: [u8; 32] = [0xAB; 32];
pub const SYSTEM_PROGRAM: Identity = Identity::new([0u8; 32]);
pub const MEMO_PROGRAM: Identity = Identity::new([5u8; 32]);
pub const TOKEN_PROGRAM: Identity = Identity::new([6u8; 32]);
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
pub const MAINNET: &str = "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp";
pub const DEVNET: &str = "solana:EtWTRABZaYq6iMfeYKouRu166VU2xqa1";

pub fn agent_signer() -> KeypairSigner {
    KeypairSigner::from_seed(&[7u8; 32])
}

pub fn agent_identity() -> Identity {
    use fuego_agent::Signer;
    agent_signer().identity()
}

pub fn recipient() -> Identity {
    Identity::new([9u8; 32])
}

pub fn merchant() -> Identity {
    Identity::new([11u8; 32])
}

pub fn facilitator() -> Identity {
    Identity::new([12u8; 32])
}

/// Legacy system transfer, optionally followed by a memo instruction.
pub fn transfer_envelope(from: &Identity, to: &Identity, lamports: u64, memo: Option<&str>) -> Vec<u8> {
    let mut account_keys = vec![*from, *to, SYSTEM_PROGRAM];
    let mut data = vec![2, 0, 0, 0];
    data.extend_from_slice(&lamports.to_le_bytes());
    let mut instructions = vec![CompiledInstruction {
        program_id_index: 2,
        accounts: vec![0, 1],
        data,
    }];
    let mut num_readonly_unsigned = 1;

    if let Some(memo) = memo {
        account_keys.push(MEMO_PROGRAM);
        num_readonly_unsigned = 2;
        instructions.push(CompiledInstruction {
            program_id_index: 3,
            accounts: vec![],
            data: memo.as_bytes().to_vec(),
        });
    }

    let message = MessageBody::Legacy(LegacyMessage {
        header: MessageHeader {
            num_required_signatures: 1,
            num_readonly_signed: 0,
            num_readonly_unsigned,
        },
        account_keys,
        recent_anchor: Anchor::new(STALE_ANCHOR),
        instructions,
    });
    encode(&UnsignedEnvelope::new(message).expect("valid transfer message"))
}

/// Versioned token payment. With a fee payer the payer signs second.
pub fn payment_envelope(
    payer: &Identity,
    pay_to: &Identity,
    amount: u64,
    fee_payer: Option<&Identity>,
) -> Vec<u8> {
    let (account_keys, required) = match fee_payer {
        Some(fee_payer) => (vec![*fee_payer, *payer, *pay_to, TOKEN_PROGRAM], 2u8),
        None => (vec![*payer, *pay_to, TOKEN_PROGRAM], 1u8),
    };
    let n = account_keys.len() as u8;
    let mut data = vec![3];
    data.extend_from_slice(&amount.to_le_bytes());

    let message = MessageBody::Versioned(VersionedMessage {
        version: 0,
        header: MessageHeader {
            num_required_signatures: required,
            num_readonly_signed: 0,
            num_readonly_unsigned: 1,
        },
        account_keys,
        recent_anchor: Anchor::new(STALE_ANCHOR),
        instructions: vec![CompiledInstruction {
            program_id_index: n - 1,
            accounts: vec![required - 1, n - 2, required - 1],
            data,
        }],
        address_table_lookups: vec![],
    });
    encode(&UnsignedEnvelope::new(message).expect("valid payment message"))
}

/// The memo the builder writes for a transfer.
pub fn builder_memo(asset: Asset, request: &TransferRequest, units: u64) -> String {
    format!(
        "fuego|{}|f:{}|t:{}|a:{}|yid:{}|n:{}",
        asset,
        request.from_address,
        request.to_address,
        units,
        request.yid,
        request.notes.as_deref().unwrap_or("")
    )
}

/// Builder behaviour matching the live service: echo the request and embed
/// the memo in the envelope.
pub fn echo_transfer(asset: Asset, request: &TransferRequest) -> Result<BuiltTransaction, GatewayError> {
    let remote = |e: String| GatewayError::Remote(e);
    let from: Identity = request.from_address.parse().map_err(|e| remote(format!("{}", e)))?;
    let to: Identity = request.to_address.parse().map_err(|e| remote(format!("{}", e)))?;
    let units = parse_amount(&request.amount, asset.decimals())
        .map_err(|_| remote("Invalid amount".to_string()))?;
    let memo = builder_memo(asset, request, units);

    Ok(BuiltTransaction {
        transaction: STANDARD.encode(transfer_envelope(&from, &to, units, Some(&memo))),
        blockhash: Some(Anchor::new(STALE_ANCHOR).to_string()),
        from: Some(request.from_address.clone()),
        to: Some(request.to_address.clone()),
        amount: Some(request.amount.clone()),
        yid: Some(request.yid.clone()),
        memo: Some(memo),
        network: Some(request.network.clone()),
    })
}

pub fn echo_payment(request: &PaymentRequest) -> Result<BuiltTransaction, GatewayError> {
    let parse = |s: &str| {
        s.parse::<Identity>()
            .map_err(|e| GatewayError::Remote(e.to_string()))
    };
    let payer = parse(&request.payer_address)?;
    let pay_to = parse(&request.pay_to_address)?;
    let fee_payer = request.fee_payer.as_deref().map(parse).transpose()?;
    let amount: u64 = request
        .amount
        .parse()
        .map_err(|_| GatewayError::Remote("Invalid amount".to_string()))?;

    Ok(BuiltTransaction {
        transaction: STANDARD.encode(payment_envelope(&payer, &pay_to, amount, fee_payer.as_ref())),
        ..BuiltTransaction::default()
    })
}

// ============================================================================
// Scripted fakes
// ============================================================================

/// Deterministic fresh anchor for the `n`th oracle call (1-based).
pub fn anchor_for_call(n: u32) -> Anchor {
    let mut bytes = [0xF0u8; 32];
    bytes[..4].copy_from_slice(&n.to_le_bytes());
    Anchor::new(bytes)
}

#[derive(Default)]
pub struct FakeAnchors {
    calls: AtomicU32,
    failures: Mutex<VecDeque<GatewayError>>,
}

impl FakeAnchors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first calls with `errors`, in order.
    pub fn failing_first(errors: Vec<GatewayError>) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures: Mutex::new(errors.into()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnchorSource for FakeAnchors {
    async fn latest_anchor(&self, _network: Network) -> Result<Anchor, GatewayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(anchor_for_call(n))
    }
}

type TransferFn = dyn Fn(Asset, &TransferRequest) -> Result<BuiltTransaction, GatewayError> + Send + Sync;
type PaymentFn = dyn Fn(&PaymentRequest) -> Result<BuiltTransaction, GatewayError> + Send + Sync;

pub struct FakeBuilder {
    transfer: Box<TransferFn>,
    payment: Box<PaymentFn>,
    delay: Option<Duration>,
    transfers: Mutex<Vec<(Asset, TransferRequest)>>,
    payments: Mutex<Vec<PaymentRequest>>,
}

impl FakeBuilder {
    pub fn echoing() -> Self {
        Self {
            transfer: Box::new(echo_transfer),
            payment: Box::new(echo_payment),
            delay: None,
            transfers: Mutex::new(Vec::new()),
            payments: Mutex::new(Vec::new()),
        }
    }

    pub fn with_transfer(
        mut self,
        f: impl Fn(Asset, &TransferRequest) -> Result<BuiltTransaction, GatewayError> + Send + Sync + 'static,
    ) -> Self {
        self.transfer = Box::new(f);
        self
    }

    pub fn with_payment(
        mut self,
        f: impl Fn(&PaymentRequest) -> Result<BuiltTransaction, GatewayError> + Send + Sync + 'static,
    ) -> Self {
        self.payment = Box::new(f);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn transfers(&self) -> Vec<(Asset, TransferRequest)> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn payments(&self) -> Vec<PaymentRequest> {
        self.payments.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransactionBuilder for FakeBuilder {
    async fn build_transfer(
        &self,
        asset: Asset,
        request: &TransferRequest,
    ) -> Result<BuiltTransaction, GatewayError> {
        self.transfers.lock().unwrap().push((asset, request.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.transfer)(asset, request)
    }

    async fn build_payment(&self, request: &PaymentRequest) -> Result<BuiltTransaction, GatewayError> {
        self.payments.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.payment)(request)
    }
}

/// Broadcaster answering from a script, then succeeding.
#[derive(Default)]
pub struct FakeBroadcaster {
    script: Mutex<VecDeque<GatewayError>>,
    received: Mutex<Vec<(BroadcastRequest, bool)>>,
}

impl FakeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first broadcasts with `errors`, in order.
    pub fn failing_first(errors: Vec<GatewayError>) -> Self {
        Self {
            script: Mutex::new(errors.into()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<(BroadcastRequest, bool)> {
        self.received.lock().unwrap().clone()
    }

    /// Envelopes received so far, decoded.
    pub fn envelopes(&self) -> Vec<UnsignedEnvelope> {
        self.received()
            .iter()
            .map(|(request, _)| {
                let bytes = STANDARD.decode(&request.transaction).expect("base64");
                decode(&bytes).expect("decodable envelope")
            })
            .collect()
    }
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
    async fn broadcast(
        &self,
        request: &BroadcastRequest,
        versioned: bool,
    ) -> Result<BroadcastReceipt, GatewayError> {
        self.received.lock().unwrap().push((request.clone(), versioned));
        if let Some(error) = self.script.lock().unwrap().pop_front() {
            return Err(error);
        }

        let bytes = STANDARD
            .decode(&request.transaction)
            .map_err(|e| GatewayError::Remote(e.to_string()))?;
        let envelope = decode(&bytes).map_err(|e| GatewayError::Remote(e.to_string()))?;
        let signature = envelope.signature_slots()[0].to_string();
        Ok(BroadcastReceipt {
            explorer_link: Some(format!(
                "https://explorer.solana.com/tx/{}?cluster={}",
                signature, request.network
            )),
            signature,
            network: Some(request.network.clone()),
            status: Some("submitted".to_string()),
        })
    }
}

/// Resource server answering from a script, then with a fallback.
pub struct FakeResources {
    script: Mutex<VecDeque<Result<ResourceResponse, GatewayError>>>,
    fallback: Option<ResourceResponse>,
    requests: Mutex<Vec<ResourceRequest>>,
}

impl FakeResources {
    pub fn scripted(responses: Vec<Result<ResourceResponse, GatewayError>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(response: ResourceResponse) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ResourceRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceClient for FakeResources {
    async fn send(&self, request: &ResourceRequest) -> Result<ResourceResponse, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(response) => response,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| GatewayError::Transport("script exhausted".to_string())),
        }
    }
}

// ============================================================================
// Challenges and responses
// ============================================================================

pub fn exact_option(network: &str, pay_to: &Identity, amount: u64) -> Value {
    json!({
        "scheme": "exact",
        "network": network,
        "amount": amount.to_string(),
        "asset": USDC_MINT,
        "payTo": pay_to.to_string(),
        "maxTimeoutSeconds": 60
    })
}

pub fn challenge(options: Vec<Value>) -> Value {
    json!({
        "x402Version": 2,
        "resource": { "url": "https://shop.example/orders" },
        "accepts": options
    })
}

pub fn payment_required(challenge: &Value) -> ResourceResponse {
    ResourceResponse {
        status: 402,
        headers: vec![(
            "payment-required".to_string(),
            STANDARD.encode(challenge.to_string()),
        )],
        body: b"{}".to_vec(),
    }
}

/// JSON POST of `body` to `url`, the shape order endpoints take.
pub fn json_post(url: &str, body: &Value) -> ResourceRequest {
    ResourceRequest {
        method: Method::POST,
        url: url.to_string(),
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Some(body.to_string().into_bytes()),
    }
}

pub fn plain(status: u16, body: &str) -> ResourceResponse {
    ResourceResponse {
        status,
        headers: vec![],
        body: body.as_bytes().to_vec(),
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub fn test_config() -> AgentConfig {
    AgentConfig {
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        ..AgentConfig::default()
    }
}

pub struct Harness {
    pub authorizer: Authorizer,
    pub builder: Arc<FakeBuilder>,
    pub anchors: Arc<FakeAnchors>,
    pub broadcaster: Arc<FakeBroadcaster>,
    pub resources: Arc<FakeResources>,
}

impl Harness {
    pub fn new(
        config: &AgentConfig,
        builder: FakeBuilder,
        anchors: FakeAnchors,
        broadcaster: FakeBroadcaster,
        resources: FakeResources,
    ) -> Self {
        let builder = Arc::new(builder);
        let anchors = Arc::new(anchors);
        let broadcaster = Arc::new(broadcaster);
        let resources = Arc::new(resources);
        let authorizer = Authorizer::with_components(
            config,
            SignerHandle::new(agent_signer()),
            builder.clone(),
            anchors.clone(),
            broadcaster.clone(),
            resources.clone(),
        );
        Self {
            authorizer,
            builder,
            anchors,
            broadcaster,
            resources,
        }
    }

    /// Echoing builder, healthy oracle and broadcaster.
    pub fn healthy(resources: FakeResources) -> Self {
        Self::new(
            &test_config(),
            FakeBuilder::echoing(),
            FakeAnchors::new(),
            FakeBroadcaster::new(),
            resources,
        )
    }
}

// ============================================================================
// Stub HTTP server
// ============================================================================

pub struct StubRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl StubRequest {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StubResponse {
    pub fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: value.to_string().into_bytes(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub type StubHandler = Arc<dyn Fn(StubRequest) -> StubResponse + Send + Sync>;

/// Serve `handler` on an ephemeral local port until the runtime shuts down.
pub async fn spawn_stub(handler: StubHandler) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let io = TokioIo::new(stream);
            let handler = handler.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body
                            .collect()
                            .await
                            .map(|collected| collected.to_bytes())
                            .unwrap_or_default();
                        let reply = handler(StubRequest {
                            method: parts.method,
                            path: parts.uri.path().to_string(),
                            headers: parts.headers,
                            body,
                        });

                        let mut response = Response::builder().status(reply.status);
                        for (name, value) in reply.headers {
                            response = response.header(name, value);
                        }
                        Ok::<_, Infallible>(
                            response
                                .body(Full::new(Bytes::from(reply.body)))
                                .expect("valid stub response"),
                        )
                    }
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    addr
}
