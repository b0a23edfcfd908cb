// Copyright (c) 2024 Botho Foundation

//! Errors surfaced to callers of the authorizer.

use fuego_core::{AmountError, EnvelopeError, Identity};
use std::fmt;
use thiserror::Error;

use crate::{
    challenge::ChallengeError, gateway::GatewayError, resign::ResignError,
    signer::SignerError, submit::SubmissionError,
};

/// Pipeline stage an error arose in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    Build = 0,
    Anchor = 1,
    Sign = 2,
    Submit = 3,
    Challenge = 4,
}

impl Stage {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Stage::Build,
            1 => Stage::Anchor,
            2 => Stage::Sign,
            3 => Stage::Submit,
            _ => Stage::Challenge,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Build => write!(f, "build"),
            Stage::Anchor => write!(f, "anchor"),
            Stage::Sign => write!(f, "sign"),
            Stage::Submit => write!(f, "submit"),
            Stage::Challenge => write!(f, "challenge"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthorizeError {
    #[error("invalid transfer: {0}")]
    InvalidIntent(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("builder refused: {0}")]
    Builder(String),

    #[error("builder returned {field} {actual:?}, expected {expected:?}")]
    IntentMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(EnvelopeError),

    #[error("no fresh anchor after {attempts} attempts: {message}")]
    AnchorUnavailable { attempts: u32, message: String },

    #[error("anchor expired: {0}")]
    AnchorExpired(String),

    #[error("simulation failed: {0}")]
    SimulationFailed(String),

    #[error("{stage}: transport error after {attempts} attempts: {message}")]
    Transport {
        stage: Stage,
        attempts: u32,
        message: String,
    },

    #[error("signer failed: {0}")]
    Signer(SignerError),

    #[error("{0} is not a required signer of the envelope")]
    SignerNotRequired(Identity),

    #[error("broadcaster rejected the envelope: {0}")]
    Rejected(String),

    #[error("envelope still needs signatures from {0:?}")]
    PartiallySigned(Vec<Identity>),

    #[error("deadline exceeded during {stage}")]
    DeadlineExceeded { stage: Stage },

    #[error("payment rejected with status {status}")]
    ChallengeRejected { status: u16 },

    #[error("payment round exhausted: {0}")]
    ChallengeExhausted(ChallengeError),
}

impl AuthorizeError {
    /// Stage the error is attributed to.
    pub fn stage(&self) -> Stage {
        match self {
            AuthorizeError::InvalidIntent(_)
            | AuthorizeError::InvalidAmount(_)
            | AuthorizeError::Builder(_)
            | AuthorizeError::IntentMismatch { .. } => Stage::Build,
            AuthorizeError::MalformedEnvelope(_) | AuthorizeError::AnchorUnavailable { .. } => {
                Stage::Anchor
            }
            AuthorizeError::Signer(_) | AuthorizeError::SignerNotRequired(_) => Stage::Sign,
            AuthorizeError::AnchorExpired(_)
            | AuthorizeError::SimulationFailed(_)
            | AuthorizeError::Rejected(_)
            | AuthorizeError::PartiallySigned(_) => Stage::Submit,
            AuthorizeError::Transport { stage, .. } | AuthorizeError::DeadlineExceeded { stage } => {
                *stage
            }
            AuthorizeError::ChallengeRejected { .. } | AuthorizeError::ChallengeExhausted(_) => {
                Stage::Challenge
            }
        }
    }

    /// Whether starting the whole flow again could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthorizeError::AnchorUnavailable { .. }
                | AuthorizeError::AnchorExpired(_)
                | AuthorizeError::Transport { .. }
                | AuthorizeError::DeadlineExceeded { .. }
        )
    }

    pub(crate) fn from_gateway(stage: Stage, attempts: u32, error: GatewayError) -> Self {
        match error {
            e if e.is_transient() => AuthorizeError::Transport {
                stage,
                attempts,
                message: e.to_string(),
            },
            GatewayError::Remote(message) => AuthorizeError::Builder(message),
            e => AuthorizeError::Builder(e.to_string()),
        }
    }
}

impl From<ResignError> for AuthorizeError {
    fn from(e: ResignError) -> Self {
        match e {
            ResignError::Malformed(e) => AuthorizeError::MalformedEnvelope(e),
            ResignError::AnchorUnavailable { attempts, message } => {
                AuthorizeError::AnchorUnavailable { attempts, message }
            }
            ResignError::SignerNotRequired(id) => AuthorizeError::SignerNotRequired(id),
            ResignError::Signer(e) => AuthorizeError::Signer(e),
        }
    }
}

impl From<SubmissionError> for AuthorizeError {
    fn from(e: SubmissionError) -> Self {
        match e {
            SubmissionError::AnchorExpired(m) => AuthorizeError::AnchorExpired(m),
            SubmissionError::SimulationFailed(m) => AuthorizeError::SimulationFailed(m),
            SubmissionError::Transport { attempts, message } => AuthorizeError::Transport {
                stage: Stage::Submit,
                attempts,
                message,
            },
            SubmissionError::Rejected(m) => AuthorizeError::Rejected(m),
            SubmissionError::PartiallySigned(missing) => AuthorizeError::PartiallySigned(missing),
        }
    }
}
