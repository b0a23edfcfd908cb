// Copyright (c) 2024 Botho Foundation

//! Submission of signed envelopes to the broadcaster.

use fuego_core::{Identity, Network, RetryConfig, SignedEnvelope};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    gateway::{BroadcastRequest, Broadcaster, GatewayError},
    retry::with_backoff,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    /// The anchor aged out before the envelope landed. Resign and retry.
    #[error("anchor expired: {0}")]
    AnchorExpired(String),

    #[error("simulation failed: {0}")]
    SimulationFailed(String),

    #[error("transport error after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },

    #[error("broadcaster rejected the envelope: {0}")]
    Rejected(String),

    #[error("envelope still needs signatures from {}", fmt_missing(.0))]
    PartiallySigned(Vec<Identity>),
}

fn fmt_missing(missing: &[Identity]) -> String {
    missing
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

const EXPIRED_MARKERS: &[&str] = &[
    "blockhash not found",
    "block height exceeded",
    "blockhash expired",
];

const SIMULATION_MARKERS: &[&str] = &[
    "simulation failed",
    "insufficient funds",
    "insufficient lamports",
    "custom program error",
];

/// Map a broadcaster-reported failure onto the submission taxonomy.
pub fn classify_remote(message: &str) -> SubmissionError {
    let lower = message.to_ascii_lowercase();
    if EXPIRED_MARKERS.iter().any(|m| lower.contains(m)) {
        SubmissionError::AnchorExpired(message.to_string())
    } else if SIMULATION_MARKERS.iter().any(|m| lower.contains(m)) {
        SubmissionError::SimulationFailed(message.to_string())
    } else {
        SubmissionError::Rejected(message.to_string())
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub signature: String,
    pub explorer_link: String,
    pub network: Network,
}

#[derive(Clone)]
pub struct SubmissionClient {
    broadcaster: Arc<dyn Broadcaster>,
    network: Network,
    commitment: Option<String>,
    retry: RetryConfig,
}

impl SubmissionClient {
    pub fn new(
        broadcaster: Arc<dyn Broadcaster>,
        network: Network,
        commitment: Option<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            broadcaster,
            network,
            commitment,
            retry,
        }
    }

    /// Broadcast a fully signed envelope.
    ///
    /// Transport failures are retried with the same bytes; the ledger
    /// deduplicates by signature so a repeat cannot double-spend.
    pub async fn submit(&self, signed: &SignedEnvelope) -> Result<Confirmation, SubmissionError> {
        if !signed.is_fully_signed() {
            return Err(SubmissionError::PartiallySigned(signed.missing_signers()));
        }

        let request = BroadcastRequest {
            network: self.network.cluster().to_string(),
            transaction: signed.to_base64(),
            commitment: self.commitment.clone(),
        };
        let versioned = signed.is_versioned();

        let receipt = with_backoff(
            &self.retry,
            "broadcast",
            GatewayError::is_transient,
            |_| self.broadcaster.broadcast(&request, versioned),
        )
        .await
        .map_err(|gave_up| match gave_up.error {
            GatewayError::Remote(message) => classify_remote(&message),
            e if e.is_transient() => SubmissionError::Transport {
                attempts: gave_up.attempts,
                message: e.to_string(),
            },
            GatewayError::Status { body, .. } => classify_remote(&body),
            e => SubmissionError::Rejected(e.to_string()),
        })?;

        let local_id = signed.transaction_id().to_string();
        if receipt.signature != local_id {
            warn!(
                remote = %receipt.signature,
                local = %local_id,
                "broadcaster reported a different signature"
            );
        }

        let explorer_link = receipt
            .explorer_link
            .unwrap_or_else(|| self.network.explorer_link(&receipt.signature));
        info!(signature = %receipt.signature, network = %self.network, "envelope submitted");

        Ok(Confirmation {
            signature: receipt.signature,
            explorer_link,
            network: self.network,
        })
    }
}
