// Copyright (c) 2024 Botho Foundation

//! Top-level flows: transfers and paid requests.
//!
//! A transfer is built remotely, verified against the caller's intent,
//! re-anchored and signed locally, then broadcast. If the broadcaster reports
//! the anchor as expired the envelope is re-anchored and resubmitted exactly
//! once from the builder's original bytes.

use base64::{engine::general_purpose::STANDARD, Engine};
use fuego_core::{
    envelope, format_amount, parse_amount, parse_positive_amount, AgentConfig, Asset,
    ChallengeState, EnvelopeError, Identity, Network, RetryConfig,
};
use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    challenge::{
        ChallengeError, ChallengeOutcome, HttpResourceClient, PaymentEngine, ResourceClient,
        ResourceRequest, ResourceResponse,
    },
    error::{AuthorizeError, Stage},
    gateway::{
        AnchorSource, Broadcaster, BuiltTransaction, GatewayError, HttpGateway, TransactionBuilder,
        TransferRequest,
    },
    resign::Resigner,
    retry::with_backoff,
    signer::SignerHandle,
    submit::{Confirmation, SubmissionClient, SubmissionError},
};

/// Longest note the builder will write into the memo.
pub const MAX_NOTES_LEN: usize = 16;

/// A transfer from the local identity on the configured network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    pub asset: Asset,
    pub to: Identity,
    /// Base units of `asset`
    pub amount: u64,
    /// Echoed by the builder and written to the memo
    pub correlation_id: String,
    pub notes: Option<String>,
    /// Priority fee in micro-lamports per compute unit
    pub priority_fee: Option<u64>,
}

impl TransferIntent {
    pub fn new(asset: Asset, to: Identity, amount: u64) -> Self {
        Self {
            asset,
            to,
            amount,
            correlation_id: new_correlation_id(),
            notes: None,
            priority_fee: None,
        }
    }

    /// Build from a display amount such as `"10.5"`, converted exactly.
    pub fn from_display_amount(asset: Asset, to: Identity, amount: &str) -> Result<Self, AuthorizeError> {
        let units = parse_positive_amount(amount, asset.decimals())?;
        Ok(Self::new(asset, to, units))
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_priority_fee(mut self, micro_lamports: u64) -> Self {
        self.priority_fee = Some(micro_lamports);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Memo text the builder attaches for this transfer from `from`.
    pub fn memo(&self, from: &Identity) -> String {
        format!(
            "fuego|{}|f:{}|t:{}|a:{}|yid:{}|n:{}",
            self.asset,
            from,
            self.to,
            self.amount,
            self.correlation_id,
            self.notes.as_deref().unwrap_or("")
        )
    }

    fn validate(&self, from: &Identity) -> Result<(), AuthorizeError> {
        if self.amount == 0 {
            return Err(AuthorizeError::InvalidIntent("amount must be greater than zero".into()));
        }
        if self.to == *from {
            return Err(AuthorizeError::InvalidIntent("recipient is the sender".into()));
        }
        if self.correlation_id.is_empty() {
            return Err(AuthorizeError::InvalidIntent("correlation id is empty".into()));
        }
        if let Some(notes) = &self.notes {
            if notes.len() > MAX_NOTES_LEN {
                return Err(AuthorizeError::InvalidIntent(format!(
                    "notes must be {} characters or less, got {}",
                    MAX_NOTES_LEN,
                    notes.len()
                )));
            }
        }
        Ok(())
    }
}

/// `agent-{pid}-{millis}`
pub fn new_correlation_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("agent-{}-{}", std::process::id(), millis)
}

/// Last stage a flow entered, readable after it is cancelled.
struct Progress(AtomicU8);

impl Progress {
    fn new() -> Self {
        Self(AtomicU8::new(Stage::Build as u8))
    }

    fn enter(&self, stage: Stage) {
        self.0.store(stage as u8, Ordering::SeqCst);
    }

    fn current(&self) -> Stage {
        Stage::from_u8(self.0.load(Ordering::SeqCst))
    }
}

/// Entry point for all flows run with the agent's key.
#[derive(Clone)]
pub struct Authorizer {
    builder: Arc<dyn TransactionBuilder>,
    resigner: Resigner,
    submitter: SubmissionClient,
    payments: PaymentEngine,
    network: Network,
    retry: RetryConfig,
}

impl Authorizer {
    /// Wire every role to the configured HTTP gateway.
    pub fn connect(config: &AgentConfig, signer: SignerHandle) -> Result<Self, GatewayError> {
        let gateway = Arc::new(HttpGateway::new(&config.gateway)?);
        let resources = Arc::new(HttpResourceClient::new(config.gateway.timeout())?);
        Ok(Self::with_components(
            config,
            signer,
            gateway.clone(),
            gateway.clone(),
            gateway,
            resources,
        ))
    }

    pub fn with_components(
        config: &AgentConfig,
        signer: SignerHandle,
        builder: Arc<dyn TransactionBuilder>,
        anchors: Arc<dyn AnchorSource>,
        broadcaster: Arc<dyn Broadcaster>,
        resources: Arc<dyn ResourceClient>,
    ) -> Self {
        let resigner = Resigner::new(signer, anchors, config.network, config.retry.clone());
        let submitter = SubmissionClient::new(
            broadcaster,
            config.network,
            config.gateway.commitment.clone(),
            config.retry.clone(),
        );
        let payments = PaymentEngine::new(
            resources,
            builder.clone(),
            resigner.clone(),
            config.network,
            config.supported_kinds(),
            config.challenge.clone(),
            config.retry.clone(),
        );

        Self {
            builder,
            resigner,
            submitter,
            payments,
            network: config.network,
            retry: config.retry.clone(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.resigner.identity()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Build, sign and submit a transfer.
    pub async fn transfer(&self, intent: &TransferIntent) -> Result<Confirmation, AuthorizeError> {
        self.run_transfer(intent, &Progress::new()).await
    }

    /// [`transfer`](Self::transfer) abandoned once `deadline` passes. Nothing
    /// is persisted, so a later attempt starts clean.
    pub async fn transfer_before(
        &self,
        intent: &TransferIntent,
        deadline: Instant,
    ) -> Result<Confirmation, AuthorizeError> {
        let progress = Progress::new();
        match tokio::time::timeout_at(deadline, self.run_transfer(intent, &progress)).await {
            Ok(result) => result,
            Err(_) => {
                let stage = progress.current();
                warn!(%stage, correlation_id = %intent.correlation_id, "transfer deadline exceeded");
                Err(AuthorizeError::DeadlineExceeded { stage })
            }
        }
    }

    async fn run_transfer(
        &self,
        intent: &TransferIntent,
        progress: &Progress,
    ) -> Result<Confirmation, AuthorizeError> {
        let from = self.identity();
        intent.validate(&from)?;

        progress.enter(Stage::Build);
        let request = TransferRequest {
            network: self.network.cluster().to_string(),
            from_address: from.to_string(),
            to_address: intent.to.to_string(),
            amount: format_amount(intent.amount, intent.asset.decimals()),
            yid: intent.correlation_id.clone(),
            notes: intent.notes.clone(),
            fee_amount: intent.priority_fee.map(|fee| fee.to_string()),
        };
        info!(
            asset = %intent.asset,
            to = %intent.to,
            amount = %request.amount,
            correlation_id = %intent.correlation_id,
            "building transfer"
        );

        let built = with_backoff(
            &self.retry,
            "build_transfer",
            GatewayError::is_transient,
            |_| self.builder.build_transfer(intent.asset, &request),
        )
        .await
        .map_err(|gave_up| AuthorizeError::from_gateway(Stage::Build, gave_up.attempts, gave_up.error))?;

        let builder_bytes = STANDARD
            .decode(built.transaction.trim())
            .map_err(|_| AuthorizeError::MalformedEnvelope(EnvelopeError::Base64))?;
        verify_built(intent, &from, &built, &builder_bytes)?;

        progress.enter(Stage::Anchor);
        let signed = self.resigner.resign(&builder_bytes).await?;

        progress.enter(Stage::Submit);
        match self.submitter.submit(&signed).await {
            Err(SubmissionError::AnchorExpired(message)) => {
                warn!(correlation_id = %intent.correlation_id, "anchor expired, re-anchoring once: {}", message);
                progress.enter(Stage::Anchor);
                let signed = self.resigner.resign(&builder_bytes).await?;
                progress.enter(Stage::Submit);
                Ok(self.submitter.submit(&signed).await?)
            }
            other => Ok(other?),
        }
    }

    /// Request a paid resource, paying once if challenged.
    pub async fn purchase(&self, request: &ResourceRequest) -> Result<ResourceResponse, AuthorizeError> {
        let outcome = self.pay(request).await;
        match outcome.state {
            ChallengeState::Accepted => outcome.response.ok_or_else(|| {
                AuthorizeError::ChallengeExhausted(ChallengeError::Transport(
                    "accepted without a response".to_string(),
                ))
            }),
            ChallengeState::Rejected => Err(AuthorizeError::ChallengeRejected {
                status: outcome.status().unwrap_or_default(),
            }),
            state => Err(AuthorizeError::ChallengeExhausted(outcome.error.unwrap_or_else(
                || ChallengeError::Transport(format!("round ended in {}", state)),
            ))),
        }
    }

    /// [`purchase`](Self::purchase) abandoned once `deadline` passes. A proof
    /// already delivered to the resource is not recalled.
    pub async fn purchase_before(
        &self,
        request: &ResourceRequest,
        deadline: Instant,
    ) -> Result<ResourceResponse, AuthorizeError> {
        match tokio::time::timeout_at(deadline, self.purchase(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(url = %request.url, "purchase deadline exceeded");
                Err(AuthorizeError::DeadlineExceeded {
                    stage: Stage::Challenge,
                })
            }
        }
    }

    /// Run a challenge round and return the full outcome.
    pub async fn pay(&self, request: &ResourceRequest) -> ChallengeOutcome {
        self.payments.run(request).await
    }
}

/// Check the builder's echo and the envelope itself against the intent.
fn verify_built(
    intent: &TransferIntent,
    from: &Identity,
    built: &BuiltTransaction,
    builder_bytes: &[u8],
) -> Result<(), AuthorizeError> {
    fn check(field: &'static str, expected: String, actual: Option<&String>) -> Result<(), AuthorizeError> {
        match actual {
            Some(actual) if *actual != expected => Err(AuthorizeError::IntentMismatch {
                field,
                expected,
                actual: actual.clone(),
            }),
            _ => Ok(()),
        }
    }

    check("from", from.to_string(), built.from.as_ref())?;
    check("to", intent.to.to_string(), built.to.as_ref())?;
    check("yid", intent.correlation_id.clone(), built.yid.as_ref())?;

    if let Some(echoed) = &built.amount {
        let units = parse_amount(echoed, intent.asset.decimals()).map_err(|_| {
            AuthorizeError::IntentMismatch {
                field: "amount",
                expected: format_amount(intent.amount, intent.asset.decimals()),
                actual: echoed.clone(),
            }
        })?;
        if units != intent.amount {
            return Err(AuthorizeError::IntentMismatch {
                field: "amount",
                expected: format_amount(intent.amount, intent.asset.decimals()),
                actual: echoed.clone(),
            });
        }
    }

    let memo = intent.memo(from);
    check("memo", memo.clone(), built.memo.as_ref())?;
    if built.memo.is_some() {
        let unsigned = envelope::decode(builder_bytes).map_err(AuthorizeError::MalformedEnvelope)?;
        let carried = unsigned
            .message()
            .instructions()
            .iter()
            .any(|ix| ix.data == memo.as_bytes());
        if !carried {
            return Err(AuthorizeError::IntentMismatch {
                field: "memo instruction",
                expected: memo,
                actual: "absent".to_string(),
            });
        }
    }

    Ok(())
}
