// Copyright (c) 2024 Botho Foundation

//! Ledger clusters and their identifiers.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown network {0:?}")]
pub struct UnknownNetwork(pub String);

/// A ledger cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    #[default]
    MainnetBeta,
    Devnet,
    Testnet,
}

impl Network {
    /// Cluster name used by the builder and in explorer links.
    pub fn cluster(&self) -> &'static str {
        match self {
            Network::MainnetBeta => "mainnet-beta",
            Network::Devnet => "devnet",
            Network::Testnet => "testnet",
        }
    }

    /// CAIP-2 chain identifier carried in payment challenges.
    pub fn caip2(&self) -> &'static str {
        match self {
            Network::MainnetBeta => "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp",
            Network::Devnet => "solana:EtWTRABZaYq6iMfeYKouRu166VU2xqa1",
            Network::Testnet => "solana:4uhcVJyU9pJkvQyS88uRDiswHXSCkY3z",
        }
    }

    pub fn explorer_link(&self, signature: &str) -> String {
        format!(
            "https://explorer.solana.com/tx/{}?cluster={}",
            signature,
            self.cluster()
        )
    }

    /// Accepts cluster names, CAIP-2 identifiers, and the bare `solana`
    /// shorthand some resource servers use for mainnet.
    pub fn parse_any(value: &str) -> Result<Self, UnknownNetwork> {
        let all = [Network::MainnetBeta, Network::Devnet, Network::Testnet];
        if let Some(n) = all.iter().find(|n| n.caip2() == value) {
            return Ok(*n);
        }
        match value {
            "solana" | "solana-mainnet" | "mainnet" | "mainnet-beta" => Ok(Network::MainnetBeta),
            "solana-devnet" | "devnet" => Ok(Network::Devnet),
            "solana-testnet" | "testnet" => Ok(Network::Testnet),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cluster())
    }
}

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_any(s)
    }
}
