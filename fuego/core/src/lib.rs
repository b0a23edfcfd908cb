// Copyright (c) 2024 Botho Foundation

//! Core types for the Fuego transaction authorizer.
//!
//! This crate holds everything that does not touch the network or the
//! signing key:
//!
//! - The transaction envelope codec and anchor substitution
//! - Exact decimal amounts, assets and networks
//! - Pay-to-proceed challenge and proof wire types
//! - Agent configuration

pub mod amount;
pub mod challenge;
pub mod config;
pub mod envelope;
pub mod keys;
pub mod network;
pub mod shortvec;

pub use amount::{format_amount, parse_amount, parse_positive_amount, AmountError, Asset};
pub use challenge::{
    ChallengeCodecError, ChallengeState, PaymentChallenge, PaymentOption, PaymentProof,
    SupportedKind,
};
pub use config::{AgentConfig, ChallengeConfig, GatewayConfig, RetryConfig};
pub use envelope::{
    decode, encode, locate_anchor, substitute_anchor, AnchoredEnvelope, EnvelopeError,
    MessageBody, SignedEnvelope, UnsignedEnvelope,
};
pub use keys::{Anchor, Identity, KeyError, Signature};
pub use network::Network;
