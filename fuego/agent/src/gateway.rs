// Copyright (c) 2024 Botho Foundation

//! Transaction gateway client.
//!
//! One HTTP service plays three roles for the agent:
//! - builder of unsigned envelopes ([`TransactionBuilder`])
//! - freshness oracle for recent anchors ([`AnchorSource`])
//! - broadcaster of signed envelopes ([`Broadcaster`])
//!
//! Every endpoint takes a JSON POST and answers with
//! `{ "success": bool, "data": ..., "error": "..." }`.

use async_trait::async_trait;
use fuego_core::{Anchor, Asset, GatewayConfig, Network};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The service answered and reported a failure.
    #[error("{0}")]
    Remote(String),
}

impl GatewayError {
    /// Connection failures, timeouts, and 5xx or 429 statuses may clear up
    /// on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Status { status, .. } => *status >= 500 || *status == 429,
            GatewayError::InvalidResponse(_) | GatewayError::Remote(_) => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::InvalidResponse(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Request for an unsigned transfer envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRequest {
    pub network: String,
    pub from_address: String,
    pub to_address: String,
    /// Display units, as a decimal string
    pub amount: String,
    /// Caller correlation id, echoed back and written to the memo
    pub yid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Priority fee in micro-lamports per compute unit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<String>,
}

/// Request for an unsigned pay-to-proceed payment envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRequest {
    pub network: String,
    pub payer_address: String,
    pub pay_to_address: String,
    /// Base units, as a decimal string
    pub amount: String,
    pub asset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_payer: Option<String>,
}

/// What the builder returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltTransaction {
    /// Base64 unsigned envelope
    pub transaction: String,
    #[serde(default)]
    pub blockhash: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub yid: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastRequest {
    pub network: String,
    /// Base64 signed envelope
    pub transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReceipt {
    pub signature: String,
    #[serde(default)]
    pub explorer_link: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LatestAnchor {
    blockhash: String,
}

/// Common response wrapper.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct NetworkRequest<'a> {
    network: &'a str,
}

#[async_trait]
pub trait TransactionBuilder: Send + Sync {
    async fn build_transfer(
        &self,
        asset: Asset,
        request: &TransferRequest,
    ) -> Result<BuiltTransaction, GatewayError>;

    async fn build_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<BuiltTransaction, GatewayError>;
}

/// Source of fresh anchors. Values are never cached.
#[async_trait]
pub trait AnchorSource: Send + Sync {
    async fn latest_anchor(&self, network: Network) -> Result<Anchor, GatewayError>;
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(
        &self,
        request: &BroadcastRequest,
        versioned: bool,
    ) -> Result<BroadcastReceipt, GatewayError>;
}

pub const LATEST_ANCHOR_ROUTE: &str = "/latest-hash";
pub const BUILD_PAYMENT_ROUTE: &str = "/build-x402-purch-payment";
pub const SUBMIT_ROUTE: &str = "/submit-transaction";
pub const SUBMIT_VERSIONED_ROUTE: &str = "/submit-versioned-transaction";

/// HTTP implementation of all three gateway roles.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<Req: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        route: &str,
        body: &Req,
    ) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, route);
        debug!(%url, "gateway request");

        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        // Failures are usually reported in-band, sometimes with an error status.
        match serde_json::from_str::<ApiResponse<T>>(&text) {
            Ok(ApiResponse {
                success: true,
                data: Some(data),
                ..
            }) if status.is_success() => Ok(data),
            Ok(ApiResponse {
                success: false,
                error,
                ..
            }) => Err(GatewayError::Remote(
                error.unwrap_or_else(|| format!("request failed with status {}", status)),
            )),
            Ok(_) if status.is_success() => Err(GatewayError::InvalidResponse(
                "success without data".to_string(),
            )),
            Err(e) if status.is_success() => Err(GatewayError::InvalidResponse(e.to_string())),
            _ => Err(GatewayError::Status {
                status: status.as_u16(),
                body: text,
            }),
        }
    }
}

#[async_trait]
impl TransactionBuilder for HttpGateway {
    async fn build_transfer(
        &self,
        asset: Asset,
        request: &TransferRequest,
    ) -> Result<BuiltTransaction, GatewayError> {
        self.call(asset.build_route(), request).await
    }

    async fn build_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<BuiltTransaction, GatewayError> {
        self.call(BUILD_PAYMENT_ROUTE, request).await
    }
}

#[async_trait]
impl AnchorSource for HttpGateway {
    async fn latest_anchor(&self, network: Network) -> Result<Anchor, GatewayError> {
        let latest: LatestAnchor = self
            .call(
                LATEST_ANCHOR_ROUTE,
                &NetworkRequest {
                    network: network.cluster(),
                },
            )
            .await?;
        latest
            .blockhash
            .parse()
            .map_err(|e| GatewayError::InvalidResponse(format!("blockhash: {}", e)))
    }
}

#[async_trait]
impl Broadcaster for HttpGateway {
    async fn broadcast(
        &self,
        request: &BroadcastRequest,
        versioned: bool,
    ) -> Result<BroadcastReceipt, GatewayError> {
        let route = if versioned {
            SUBMIT_VERSIONED_ROUTE
        } else {
            SUBMIT_ROUTE
        };
        self.call(route, request).await
    }
}
