// Copyright (c) 2024 Botho Foundation

//! Pay-to-proceed (x402) wire types and the challenge state machine.
//!
//! A resource server answering `402 Payment Required` describes the payments
//! it will take in a base64 JSON challenge header. The client picks one
//! option, pays, and retries once with a base64 JSON proof header.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::{
    keys::{Identity, KeyError},
    network::Network,
};

/// Default header carrying the challenge on a 402 response.
pub const CHALLENGE_HEADER: &str = "payment-required";

/// Default header carrying the proof on the retried request.
pub const PROOF_HEADER: &str = "X-PAYMENT-SIGNATURE";

/// The only payment scheme this client can satisfy.
pub const SCHEME_EXACT: &str = "exact";

pub const DEFAULT_MAX_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Error)]
pub enum ChallengeCodecError {
    #[error("header is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("challenge lists no payment options")]
    NoOptions,
}

/// Base-unit amounts arrive as decimal strings or as bare numbers.
mod base_units {
    use super::*;

    pub fn serialize<S: Serializer>(amount: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(amount)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }
}

fn default_max_timeout() -> u64 {
    DEFAULT_MAX_TIMEOUT_SECONDS
}

/// Scheme-specific extras attached to an option.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentExtra {
    /// Party that pays network fees and co-signs after the payer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_payer: Option<String>,
}

impl PaymentExtra {
    fn is_empty(&self) -> bool {
        self.fee_payer.is_none()
    }
}

/// One acceptable way to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOption {
    pub scheme: String,
    pub network: String,
    /// Base units of `asset`.
    #[serde(alias = "maxAmountRequired", with = "base_units")]
    pub amount: u64,
    /// Mint address or ticker.
    pub asset: String,
    /// Recipient address. Only options on a supported network are
    /// guaranteed to carry a ledger identity here.
    pub pay_to: String,
    #[serde(default = "default_max_timeout")]
    pub max_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "PaymentExtra::is_empty")]
    pub extra: PaymentExtra,
}

impl PaymentOption {
    pub fn pay_to_identity(&self) -> Result<Identity, KeyError> {
        self.pay_to.parse()
    }

    pub fn fee_payer(&self) -> Result<Option<Identity>, KeyError> {
        self.extra
            .fee_payer
            .as_deref()
            .map(|s| s.parse::<Identity>())
            .transpose()
    }
}

/// The body of a 402 challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    #[serde(default = "default_version")]
    pub x402_version: u32,
    pub accepts: Vec<PaymentOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl PaymentChallenge {
    /// Decode a challenge from its header value.
    pub fn from_header(value: &str) -> Result<Self, ChallengeCodecError> {
        Self::checked(decode_header(value)?)
    }

    /// Decode a challenge carried as a plain JSON body (older servers).
    pub fn from_body(body: &[u8]) -> Result<Self, ChallengeCodecError> {
        Self::checked(serde_json::from_slice(body)?)
    }

    fn checked(challenge: Self) -> Result<Self, ChallengeCodecError> {
        if challenge.accepts.is_empty() {
            return Err(ChallengeCodecError::NoOptions);
        }
        Ok(challenge)
    }

    pub fn to_header(&self) -> Result<String, ChallengeCodecError> {
        encode_header(self)
    }

    /// First option whose scheme and network are both supported. Options are
    /// tried in the server's order.
    pub fn select<'a>(&'a self, supported: &[SupportedKind]) -> Option<&'a PaymentOption> {
        self.accepts
            .iter()
            .find(|option| supported.iter().any(|kind| kind.matches(option)))
    }

    /// Like [`select`](Self::select), but skips options on any cluster
    /// other than `network`, since the signer cannot pay them.
    pub fn select_payable<'a>(
        &'a self,
        supported: &[SupportedKind],
        network: Network,
    ) -> Option<&'a PaymentOption> {
        self.accepts.iter().find(|option| {
            Network::parse_any(&option.network).is_ok_and(|n| n == network)
                && supported.iter().any(|kind| kind.matches(option))
        })
    }
}

/// A `(scheme, network)` pair the client is able to pay with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedKind {
    pub scheme: String,
    pub network: String,
}

impl SupportedKind {
    pub fn new(scheme: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            network: network.into(),
        }
    }

    /// `exact` payments on `network`, named by its CAIP-2 id.
    pub fn exact(network: Network) -> Self {
        Self::new(SCHEME_EXACT, network.caip2())
    }

    /// Networks compare by cluster when both sides name a known cluster, so
    /// `solana` matches the mainnet CAIP-2 id.
    pub fn matches(&self, option: &PaymentOption) -> bool {
        if self.scheme != option.scheme {
            return false;
        }
        match (
            Network::parse_any(&self.network),
            Network::parse_any(&option.network),
        ) {
            (Ok(ours), Ok(theirs)) => ours == theirs,
            _ => self.network == option.network,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofPayload {
    /// Base64 signed envelope.
    pub transaction: String,
}

/// Proof of payment attached to the retried request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: ProofPayload,
}

impl PaymentProof {
    /// Proof answering `option`, echoing the challenge version and the
    /// option's network string verbatim.
    pub fn for_option(x402_version: u32, option: &PaymentOption, transaction: String) -> Self {
        Self {
            x402_version,
            scheme: option.scheme.clone(),
            network: option.network.clone(),
            payload: ProofPayload { transaction },
        }
    }

    pub fn to_header(&self) -> Result<String, ChallengeCodecError> {
        encode_header(self)
    }

    pub fn from_header(value: &str) -> Result<Self, ChallengeCodecError> {
        decode_header(value)
    }
}

/// Serialize `value` as base64 JSON.
pub fn encode_header<T: Serialize>(value: &T) -> Result<String, ChallengeCodecError> {
    Ok(STANDARD.encode(serde_json::to_vec(value)?))
}

/// Parse a base64 JSON header value.
pub fn decode_header<T: DeserializeOwned>(value: &str) -> Result<T, ChallengeCodecError> {
    let bytes = STANDARD.decode(value.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Progress of one pay-to-proceed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    /// Nothing sent yet.
    Initial,
    /// Request sent without a proof.
    AwaitingChallenge,
    /// A 402 with a decodable challenge came back.
    ChallengeReceived,
    /// An option was chosen and a signed payment wrapped as a proof.
    ProofBuilt,
    /// The request was resent with the proof.
    Retried,
    /// The resource was served.
    Accepted,
    /// The server refused, either outright or after seeing the proof.
    Rejected,
    /// The round could not complete: transport, decode or selection failure.
    Exhausted,
}

impl ChallengeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChallengeState::Accepted | ChallengeState::Rejected | ChallengeState::Exhausted
        )
    }

    /// Whether moving from `self` to `next` is allowed. There is no edge
    /// from `Retried` back to `ChallengeReceived`.
    pub fn can_transition_to(&self, next: ChallengeState) -> bool {
        use ChallengeState::*;
        matches!(
            (self, next),
            (Initial, AwaitingChallenge)
                | (AwaitingChallenge, ChallengeReceived)
                | (AwaitingChallenge, Accepted)
                | (AwaitingChallenge, Rejected)
                | (AwaitingChallenge, Exhausted)
                | (ChallengeReceived, ProofBuilt)
                | (ChallengeReceived, Exhausted)
                | (ProofBuilt, Retried)
                | (ProofBuilt, Exhausted)
                | (Retried, Accepted)
                | (Retried, Rejected)
                | (Retried, Exhausted)
        )
    }
}

impl fmt::Display for ChallengeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChallengeState::Initial => "initial",
            ChallengeState::AwaitingChallenge => "awaiting_challenge",
            ChallengeState::ChallengeReceived => "challenge_received",
            ChallengeState::ProofBuilt => "proof_built",
            ChallengeState::Retried => "retried",
            ChallengeState::Accepted => "accepted",
            ChallengeState::Rejected => "rejected",
            ChallengeState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}
