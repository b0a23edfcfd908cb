// Copyright (c) 2024 Botho Foundation

//! Assets and exact decimal amounts.
//!
//! Human amounts such as `"10.5"` are converted to integer base units without
//! passing through floating point, so `"10.5"` USDC is always exactly
//! `10_500_000`.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("empty amount")]
    Empty,

    #[error("invalid amount {0:?}")]
    Invalid(String),

    #[error("amount {amount:?} has more than {decimals} decimal places")]
    TooPrecise { amount: String, decimals: u8 },

    #[error("amount {0:?} overflows u64 base units")]
    Overflow(String),

    #[error("amount must be greater than zero")]
    Zero,

    #[error("unknown asset {0:?}")]
    UnknownAsset(String),
}

/// Transferable assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    Sol,
    Usdc,
    Usdt,
}

impl Asset {
    /// Decimal places between display units and base units.
    pub fn decimals(&self) -> u8 {
        match self {
            Asset::Sol => 9,
            Asset::Usdc | Asset::Usdt => 6,
        }
    }

    /// Token mint, `None` for the native asset.
    pub fn mint(&self) -> Option<&'static str> {
        match self {
            Asset::Sol => None,
            Asset::Usdc => Some("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"),
            Asset::Usdt => Some("Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenEqw"),
        }
    }

    /// Builder route producing a transfer of this asset.
    pub fn build_route(&self) -> &'static str {
        match self {
            Asset::Sol => "/build-transfer-sol",
            Asset::Usdc => "/build-transfer-usdc",
            Asset::Usdt => "/build-transfer-usdt",
        }
    }

    /// Resolve an asset from a ticker or a mint address, as payment options
    /// may carry either.
    pub fn from_mint_or_symbol(value: &str) -> Result<Self, AmountError> {
        if let Ok(asset) = value.parse() {
            return Ok(asset);
        }
        [Asset::Usdc, Asset::Usdt]
            .into_iter()
            .find(|a| a.mint() == Some(value))
            .ok_or_else(|| AmountError::UnknownAsset(value.to_string()))
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Sol => write!(f, "SOL"),
            Asset::Usdc => write!(f, "USDC"),
            Asset::Usdt => write!(f, "USDT"),
        }
    }
}

impl FromStr for Asset {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sol" => Ok(Asset::Sol),
            "usdc" => Ok(Asset::Usdc),
            "usdt" => Ok(Asset::Usdt),
            _ => Err(AmountError::UnknownAsset(s.to_string())),
        }
    }
}

/// Parse a decimal string into base units with `decimals` places.
///
/// Accepts `"10"`, `"10.5"`, `".5"` and `"10."`. Rejects signs, exponents,
/// separators and more fractional digits than `decimals`.
pub fn parse_amount(text: &str, decimals: u8) -> Result<u64, AmountError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AmountError::Empty);
    }

    let (whole, frac) = match text.split_once('.') {
        Some((w, f)) => (w, f),
        None => (text, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(AmountError::Invalid(text.to_string()));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::Invalid(text.to_string()));
    }
    if frac.len() > decimals as usize {
        return Err(AmountError::TooPrecise {
            amount: text.to_string(),
            decimals,
        });
    }

    let overflow = || AmountError::Overflow(text.to_string());
    let scale = 10u64.checked_pow(decimals as u32).ok_or_else(overflow)?;

    let whole_units = if whole.is_empty() {
        0
    } else {
        whole.parse::<u64>().map_err(|_| overflow())?
    };
    let frac_units = if frac.is_empty() {
        0
    } else {
        let padding = 10u64.pow((decimals as usize - frac.len()) as u32);
        frac.parse::<u64>().map_err(|_| overflow())? * padding
    };

    whole_units
        .checked_mul(scale)
        .and_then(|u| u.checked_add(frac_units))
        .ok_or_else(overflow)
}

/// Like [`parse_amount`] but rejects zero.
pub fn parse_positive_amount(text: &str, decimals: u8) -> Result<u64, AmountError> {
    match parse_amount(text, decimals)? {
        0 => Err(AmountError::Zero),
        units => Ok(units),
    }
}

/// Render base units as a decimal string, trimming trailing zeros.
pub fn format_amount(units: u64, decimals: u8) -> String {
    if decimals == 0 {
        return units.to_string();
    }
    let scale = 10u64.pow(decimals as u32);
    let whole = units / scale;
    let frac = units % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = decimals as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
