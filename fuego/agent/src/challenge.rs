// Copyright (c) 2024 Botho Foundation

//! Pay-to-proceed challenge engine.
//!
//! Drives one request through
//! `Initial -> AwaitingChallenge -> ChallengeReceived -> ProofBuilt -> Retried`
//! and into exactly one of `Accepted`, `Rejected` or `Exhausted`. At most one
//! proof is ever produced per request, and a second 402 is final.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use fuego_core::{
    challenge::ChallengeCodecError, Asset, ChallengeConfig, ChallengeState, EnvelopeError, Network,
    PaymentChallenge, PaymentOption, PaymentProof, RetryConfig, SupportedKind,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    gateway::{GatewayError, PaymentRequest, TransactionBuilder},
    resign::{ResignError, Resigner},
    retry::with_backoff,
};

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("undecodable challenge: {0}")]
    Decode(#[from] ChallengeCodecError),

    #[error("no supported payment option among [{}]", .offered.join(", "))]
    NoSupportedOption { offered: Vec<String> },

    #[error("unusable payment option: {0}")]
    InvalidOption(String),

    #[error("builder failed: {0}")]
    Builder(GatewayError),

    #[error(transparent)]
    Resign(#[from] ResignError),
}

/// An outgoing request to a paid resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ResourceRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ResourceResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Transport to paid resources.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn send(&self, request: &ResourceRequest) -> Result<ResourceResponse, GatewayError>;
}

/// reqwest-backed [`ResourceClient`].
#[derive(Debug, Clone)]
pub struct HttpResourceClient {
    client: reqwest::Client,
}

impl HttpResourceClient {
    pub fn new(timeout: std::time::Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResourceClient for HttpResourceClient {
    async fn send(&self, request: &ResourceRequest) -> Result<ResourceResponse, GatewayError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(ResourceResponse {
            status,
            headers,
            body,
        })
    }
}

/// How a challenge round ended.
#[derive(Debug)]
pub struct ChallengeOutcome {
    /// Terminal state.
    pub state: ChallengeState,
    /// Every state visited, starting with `Initial`.
    pub trace: Vec<ChallengeState>,
    /// Last response received, if any.
    pub response: Option<ResourceResponse>,
    /// The proof that was sent, if one was built.
    pub proof: Option<PaymentProof>,
    /// Cause of an `Exhausted` ending.
    pub error: Option<ChallengeError>,
}

impl ChallengeOutcome {
    pub fn is_accepted(&self) -> bool {
        self.state == ChallengeState::Accepted
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }
}

struct Round {
    state: ChallengeState,
    trace: Vec<ChallengeState>,
    response: Option<ResourceResponse>,
    proof: Option<PaymentProof>,
}

impl Round {
    fn new() -> Self {
        Self {
            state: ChallengeState::Initial,
            trace: vec![ChallengeState::Initial],
            response: None,
            proof: None,
        }
    }

    fn advance(&mut self, next: ChallengeState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal challenge transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "challenge state");
        self.state = next;
        self.trace.push(next);
    }

    fn finish(mut self, state: ChallengeState, error: Option<ChallengeError>) -> ChallengeOutcome {
        self.advance(state);
        ChallengeOutcome {
            state: self.state,
            trace: self.trace,
            response: self.response,
            proof: self.proof,
            error,
        }
    }

    fn exhausted(self, error: ChallengeError) -> ChallengeOutcome {
        warn!(from = %self.state, "challenge round exhausted: {}", error);
        self.finish(ChallengeState::Exhausted, Some(error))
    }
}

/// Answers 402 challenges by paying with the local key.
#[derive(Clone)]
pub struct PaymentEngine {
    resources: Arc<dyn ResourceClient>,
    builder: Arc<dyn TransactionBuilder>,
    resigner: Resigner,
    network: Network,
    supported: Vec<SupportedKind>,
    config: ChallengeConfig,
    retry: RetryConfig,
}

impl PaymentEngine {
    pub fn new(
        resources: Arc<dyn ResourceClient>,
        builder: Arc<dyn TransactionBuilder>,
        resigner: Resigner,
        network: Network,
        supported: Vec<SupportedKind>,
        config: ChallengeConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            resources,
            builder,
            resigner,
            network,
            supported,
            config,
            retry,
        }
    }

    /// Run one challenge round for `request`.
    pub async fn run(&self, request: &ResourceRequest) -> ChallengeOutcome {
        let mut round = Round::new();

        round.advance(ChallengeState::AwaitingChallenge);
        let first = match self.resources.send(request).await {
            Ok(response) => response,
            Err(e) => return round.exhausted(ChallengeError::Transport(e.to_string())),
        };
        let first_status = first.status;
        let decoded = (first_status == 402).then(|| self.decode_challenge(&first));
        round.response = Some(first);

        let challenge = match decoded {
            Some(Ok(challenge)) => challenge,
            Some(Err(e)) => return round.exhausted(e),
            None => {
                let state = if (200..300).contains(&first_status) {
                    ChallengeState::Accepted
                } else {
                    ChallengeState::Rejected
                };
                info!(url = %request.url, status = first_status, %state, "served without payment");
                return round.finish(state, None);
            }
        };
        round.advance(ChallengeState::ChallengeReceived);

        let proof = match self.build_proof(&challenge).await {
            Ok(proof) => proof,
            Err(e) => return round.exhausted(e),
        };
        let header = match proof.to_header() {
            Ok(header) => header,
            Err(e) => return round.exhausted(e.into()),
        };
        round.proof = Some(proof);
        round.advance(ChallengeState::ProofBuilt);

        let paid = request
            .clone()
            .with_header(self.config.proof_header.clone(), header);
        round.advance(ChallengeState::Retried);
        let second = match self.resources.send(&paid).await {
            Ok(response) => response,
            Err(e) => return round.exhausted(ChallengeError::Transport(e.to_string())),
        };
        let status = second.status;
        round.response = Some(second);

        if self.config.accepted_statuses.contains(&status) {
            info!(url = %request.url, status, "payment accepted");
            round.finish(ChallengeState::Accepted, None)
        } else {
            warn!(url = %request.url, status, "payment rejected");
            round.finish(ChallengeState::Rejected, None)
        }
    }

    fn decode_challenge(&self, response: &ResourceResponse) -> Result<PaymentChallenge, ChallengeError> {
        match response.header(&self.config.challenge_header) {
            Some(value) => Ok(PaymentChallenge::from_header(value)?),
            None => Ok(PaymentChallenge::from_body(&response.body)?),
        }
    }

    async fn build_proof(&self, challenge: &PaymentChallenge) -> Result<PaymentProof, ChallengeError> {
        let option = challenge
            .select_payable(&self.supported, self.network)
            .ok_or_else(|| ChallengeError::NoSupportedOption {
                offered: challenge
                    .accepts
                    .iter()
                    .map(|o| format!("{}/{}", o.scheme, o.network))
                    .collect(),
            })?;
        debug!(
            scheme = %option.scheme,
            network = %option.network,
            amount = option.amount,
            asset = %option.asset,
            "selected payment option"
        );

        let request = self.payment_request(option)?;
        let built = with_backoff(
            &self.retry,
            "build_payment",
            GatewayError::is_transient,
            |_| self.builder.build_payment(&request),
        )
        .await
        .map_err(|gave_up| ChallengeError::Builder(gave_up.error))?;

        let bytes = STANDARD
            .decode(built.transaction.trim())
            .map_err(|_| ResignError::Malformed(EnvelopeError::Base64))?;
        let signed = self.resigner.resign(&bytes).await?;

        Ok(PaymentProof::for_option(
            challenge.x402_version,
            option,
            signed.to_base64(),
        ))
    }

    fn payment_request(&self, option: &PaymentOption) -> Result<PaymentRequest, ChallengeError> {
        let network = Network::parse_any(&option.network)
            .map_err(|e| ChallengeError::InvalidOption(e.to_string()))?;
        if network != self.network {
            return Err(ChallengeError::InvalidOption(format!(
                "option is on {} but the agent signs for {}",
                network, self.network
            )));
        }
        if option.amount == 0 {
            return Err(ChallengeError::InvalidOption("zero amount".to_string()));
        }
        let pay_to = option
            .pay_to_identity()
            .map_err(|e| ChallengeError::InvalidOption(format!("payTo: {}", e)))?;
        let fee_payer = option
            .fee_payer()
            .map_err(|e| ChallengeError::InvalidOption(format!("feePayer: {}", e)))?;
        let asset = Asset::from_mint_or_symbol(&option.asset)
            .map_err(|e| ChallengeError::InvalidOption(e.to_string()))?;
        let mint = asset.mint().ok_or_else(|| {
            ChallengeError::InvalidOption(format!("{} has no token mint", asset))
        })?;

        Ok(PaymentRequest {
            network: network.cluster().to_string(),
            payer_address: self.resigner.identity().to_string(),
            pay_to_address: pay_to.to_string(),
            amount: option.amount.to_string(),
            asset: mint.to_string(),
            fee_payer: fee_payer.map(|f| f.to_string()),
        })
    }
}
