// Copyright (c) 2024 Botho Foundation

//! Tests over real HTTP against a local stub gateway.

mod common;

use base64::{engine::general_purpose::STANDARD, Engine};
use common::*;
use fuego_agent::{
    gateway::{BroadcastRequest, PaymentRequest, TransferRequest},
    signer, AnchorSource, Authorizer, Broadcaster, GatewayError, HttpGateway, ResourceRequest,
    SignerHandle, TransferIntent,
};
use fuego_core::{decode, AgentConfig, Asset, GatewayConfig, Network};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

// ============================================================================
// Stub gateway
// ============================================================================

fn field(body: &Value, name: &str) -> String {
    body[name].as_str().unwrap_or_default().to_string()
}

fn ok(data: impl serde::Serialize) -> StubResponse {
    StubResponse::json(200, json!({ "success": true, "data": data }))
}

fn failed(message: &str) -> StubResponse {
    StubResponse::json(200, json!({ "success": false, "error": message }))
}

/// Verify every filled slot against its signer, as a real broadcaster would.
fn submit(body: &Value, network: &str) -> StubResponse {
    let Ok(bytes) = STANDARD.decode(field(body, "transaction")) else {
        return failed("invalid base64");
    };
    let Ok(envelope) = decode(&bytes) else {
        return failed("failed to deserialize transaction");
    };
    let message = envelope.message_bytes();
    let signers = envelope.message().required_signers().to_vec();
    let valid = signers
        .iter()
        .zip(envelope.signature_slots())
        .all(|(key, sig)| signer::verify(key, &message, sig));
    if !valid {
        return failed("Transaction signature verification failure");
    }

    let signature = envelope.signature_slots()[0].to_string();
    ok(json!({
        "signature": signature,
        "network": network,
        "status": "submitted"
    }))
}

struct StubGateway {
    addr: SocketAddr,
    paths: Arc<Mutex<Vec<String>>>,
}

impl StubGateway {
    async fn start() -> Self {
        let paths = Arc::new(Mutex::new(Vec::new()));
        let anchors = Arc::new(AtomicU32::new(0));
        let log = paths.clone();

        let handler: StubHandler = Arc::new(move |req: StubRequest| {
            log.lock().unwrap().push(req.path.clone());
            let body = req.json();

            match req.path.as_str() {
                "/latest-hash" => {
                    let n = anchors.fetch_add(1, Ordering::SeqCst) + 1;
                    ok(json!({ "blockhash": anchor_for_call(n).to_string() }))
                }
                "/build-transfer-usdc" => {
                    let request = TransferRequest {
                        network: field(&body, "network"),
                        from_address: field(&body, "from_address"),
                        to_address: field(&body, "to_address"),
                        amount: field(&body, "amount"),
                        yid: field(&body, "yid"),
                        notes: body["notes"].as_str().map(str::to_string),
                        fee_amount: None,
                    };
                    match echo_transfer(Asset::Usdc, &request) {
                        Ok(built) => ok(built),
                        Err(e) => failed(&e.to_string()),
                    }
                }
                "/build-x402-purch-payment" => {
                    let request = PaymentRequest {
                        network: field(&body, "network"),
                        payer_address: field(&body, "payer_address"),
                        pay_to_address: field(&body, "pay_to_address"),
                        amount: field(&body, "amount"),
                        asset: field(&body, "asset"),
                        fee_payer: body["fee_payer"].as_str().map(str::to_string),
                    };
                    match echo_payment(&request) {
                        Ok(built) => ok(built),
                        Err(e) => failed(&e.to_string()),
                    }
                }
                "/submit-transaction" | "/submit-versioned-transaction" => {
                    submit(&body, &field(&body, "network"))
                }
                "/paid" => match req.headers.get("x-payment-signature") {
                    Some(_) => StubResponse::json(201, json!({ "order": "o-7" })),
                    None => {
                        let offer = challenge(vec![exact_option(MAINNET, &merchant(), 40_000)]);
                        StubResponse::json(402, json!({}))
                            .with_header("payment-required", &STANDARD.encode(offer.to_string()))
                    }
                },
                path if path.starts_with("/broken") => StubResponse {
                    status: 500,
                    headers: vec![],
                    body: b"upstream timeout".to_vec(),
                },
                path if path.starts_with("/garbage") => StubResponse {
                    status: 200,
                    headers: vec![],
                    body: b"<html>".to_vec(),
                },
                _ => StubResponse::json(404, json!({ "success": false, "error": "Not found" })),
            }
        });

        let addr = spawn_stub(handler).await;
        Self { addr, paths }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    fn config(&self) -> AgentConfig {
        let mut config = test_config();
        config.gateway.url = self.url();
        config
    }

    fn gateway_at(&self, route_prefix: &str) -> HttpGateway {
        HttpGateway::new(&GatewayConfig {
            url: format!("{}{}", self.url(), route_prefix),
            ..GatewayConfig::default()
        })
        .unwrap()
    }
}

// ============================================================================
// Full flows
// ============================================================================

mod flows {
    use super::*;

    #[tokio::test]
    async fn test_transfer_over_http() {
        let stub = StubGateway::start().await;
        let authorizer = Authorizer::connect(&stub.config(), SignerHandle::new(agent_signer())).unwrap();

        let intent = TransferIntent::from_display_amount(Asset::Usdc, recipient(), "10.5")
            .unwrap()
            .with_correlation_id("order-9");
        let confirmation = authorizer.transfer(&intent).await.unwrap();

        assert_eq!(
            stub.paths(),
            vec!["/build-transfer-usdc", "/latest-hash", "/submit-transaction"]
        );
        assert_eq!(confirmation.network, Network::MainnetBeta);
        assert_eq!(
            confirmation.explorer_link,
            Network::MainnetBeta.explorer_link(&confirmation.signature)
        );
    }

    #[tokio::test]
    async fn test_purchase_over_http() {
        let stub = StubGateway::start().await;
        let authorizer = Authorizer::connect(&stub.config(), SignerHandle::new(agent_signer())).unwrap();

        let response = authorizer
            .purchase(&ResourceRequest::get(format!("{}/paid", stub.url())))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        let body: Value = response.json().unwrap();
        assert_eq!(body["order"], "o-7");
        assert_eq!(
            stub.paths(),
            vec!["/paid", "/build-x402-purch-payment", "/latest-hash", "/paid"]
        );
    }
}

// ============================================================================
// Gateway client
// ============================================================================

mod client {
    use super::*;

    #[tokio::test]
    async fn test_latest_anchor() {
        let stub = StubGateway::start().await;
        let gateway = stub.gateway_at("");

        let first = gateway.latest_anchor(Network::Devnet).await.unwrap();
        let second = gateway.latest_anchor(Network::Devnet).await.unwrap();

        assert_eq!(first, anchor_for_call(1));
        assert_eq!(second, anchor_for_call(2));
    }

    #[tokio::test]
    async fn test_versioned_envelopes_use_versioned_route() {
        let stub = StubGateway::start().await;
        let gateway = stub.gateway_at("");
        let request = BroadcastRequest {
            network: "mainnet-beta".into(),
            transaction: STANDARD.encode(payment_envelope(&agent_identity(), &merchant(), 1, None)),
            commitment: None,
        };

        // Unsigned, so the stub refuses it, but on the right route.
        let err = gateway.broadcast(&request, true).await.unwrap_err();

        assert_eq!(stub.paths(), vec!["/submit-versioned-transaction"]);
        assert!(matches!(err, GatewayError::Remote(ref m) if m.contains("verification failure")));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let stub = StubGateway::start().await;

        let err = stub
            .gateway_at("/broken")
            .latest_anchor(Network::Devnet)
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Status { status: 500, ref body } if body == "upstream timeout"));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_non_json_success_is_invalid() {
        let stub = StubGateway::start().await;

        let err = stub
            .gateway_at("/garbage")
            .latest_anchor(Network::Devnet)
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::InvalidResponse(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_route_reports_in_band_error() {
        let stub = StubGateway::start().await;

        let err = stub
            .gateway_at("/v2")
            .latest_anchor(Network::Devnet)
            .await
            .unwrap_err();

        assert_eq!(err, GatewayError::Remote("Not found".into()));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let gateway = HttpGateway::new(&GatewayConfig {
            url: format!("http://{}", addr),
            ..GatewayConfig::default()
        })
        .unwrap();

        let err = gateway.latest_anchor(Network::Devnet).await.unwrap_err();

        assert!(matches!(err, GatewayError::Transport(_)));
        assert!(err.is_transient());
    }
}
