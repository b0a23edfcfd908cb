// Copyright (c) 2024 Botho Foundation

//! The resign pipeline: decode, fetch a fresh anchor, substitute, sign,
//! encode.
//!
//! Signing only ever happens over the bytes of an [`AnchoredEnvelope`], the
//! type produced by anchor substitution, so a signature can never cover the
//! builder's stale anchor.

use fuego_core::{
    envelope::{self, AnchoredEnvelope},
    Anchor, EnvelopeError, Identity, Network, RetryConfig, SignedEnvelope, UnsignedEnvelope,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    gateway::AnchorSource,
    retry::with_backoff,
    signer::{self, SignerError, SignerHandle},
};

#[derive(Debug, Error)]
pub enum ResignError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] EnvelopeError),

    #[error("no fresh anchor after {attempts} attempts: {message}")]
    AnchorUnavailable { attempts: u32, message: String },

    #[error("{0} is not a required signer of this envelope")]
    SignerNotRequired(Identity),

    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Re-anchors and signs builder envelopes with the local key.
#[derive(Clone)]
pub struct Resigner {
    signer: SignerHandle,
    anchors: Arc<dyn AnchorSource>,
    network: Network,
    retry: RetryConfig,
}

impl Resigner {
    pub fn new(
        signer: SignerHandle,
        anchors: Arc<dyn AnchorSource>,
        network: Network,
        retry: RetryConfig,
    ) -> Self {
        Self {
            signer,
            anchors,
            network,
            retry,
        }
    }

    pub fn identity(&self) -> Identity {
        self.signer.identity()
    }

    /// Full cycle against a freshly fetched anchor.
    pub async fn resign(&self, builder_bytes: &[u8]) -> Result<SignedEnvelope, ResignError> {
        let unsigned = self.decode_for_local_signer(builder_bytes)?;
        let anchor = self.fresh_anchor().await?;
        self.sign_anchored(unsigned.substitute_anchor(&anchor)?).await
    }

    /// Same cycle with an anchor the caller already holds.
    pub async fn resign_with_anchor(
        &self,
        builder_bytes: &[u8],
        anchor: &Anchor,
    ) -> Result<SignedEnvelope, ResignError> {
        let unsigned = self.decode_for_local_signer(builder_bytes)?;
        self.sign_anchored(unsigned.substitute_anchor(anchor)?).await
    }

    fn decode_for_local_signer(&self, bytes: &[u8]) -> Result<UnsignedEnvelope, ResignError> {
        let unsigned = envelope::decode(bytes)?;
        let identity = self.signer.identity();
        if unsigned.message().signer_index(&identity).is_none() {
            return Err(ResignError::SignerNotRequired(identity));
        }
        Ok(unsigned)
    }

    async fn fresh_anchor(&self) -> Result<Anchor, ResignError> {
        let network = self.network;
        with_backoff(
            &self.retry,
            "latest_anchor",
            |e: &crate::gateway::GatewayError| e.is_transient(),
            |_| self.anchors.latest_anchor(network),
        )
        .await
        .map_err(|gave_up| ResignError::AnchorUnavailable {
            attempts: gave_up.attempts,
            message: gave_up.error.to_string(),
        })
    }

    async fn sign_anchored(&self, anchored: AnchoredEnvelope) -> Result<SignedEnvelope, ResignError> {
        let identity = self.signer.identity();
        let signature = self.signer.sign(anchored.message_bytes()).await?;
        if !signer::verify(&identity, anchored.message_bytes(), &signature) {
            return Err(SignerError::InvalidSignature.into());
        }

        let anchor = *anchored.anchor();
        let signed = anchored
            .attach_signature(&identity, signature)
            .map_err(|e| match e {
                EnvelopeError::NotRequiredSigner(id) => ResignError::SignerNotRequired(id),
                other => ResignError::Malformed(other),
            })?;

        debug!(%anchor, "envelope re-anchored");
        info!(
            signer = %identity,
            fully_signed = signed.is_fully_signed(),
            "envelope signed"
        );
        Ok(signed)
    }
}
