// Copyright (c) 2024 Botho Foundation

//! Local transaction authorization agent.
//!
//! Holds one ed25519 key and uses it to:
//!
//! - re-anchor and sign envelopes produced by a remote builder
//! - submit signed envelopes and classify broadcaster failures
//! - answer HTTP 402 payment challenges with a single signed proof
//!
//! The key never leaves the process; remote services only ever see signed
//! envelopes and public identities.

pub mod authorizer;
pub mod challenge;
pub mod error;
pub mod gateway;
pub mod resign;
pub mod retry;
pub mod signer;
pub mod submit;
pub mod telemetry;

pub use authorizer::{Authorizer, TransferIntent};
pub use challenge::{
    ChallengeError, ChallengeOutcome, PaymentEngine, ResourceClient, ResourceRequest,
    ResourceResponse,
};
pub use error::{AuthorizeError, Stage};
pub use gateway::{AnchorSource, Broadcaster, GatewayError, HttpGateway, TransactionBuilder};
pub use resign::{ResignError, Resigner};
pub use signer::{KeypairSigner, Signer, SignerError, SignerHandle};
pub use submit::{Confirmation, SubmissionClient, SubmissionError};
