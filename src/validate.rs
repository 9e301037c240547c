// src/validate.rs
//! Range checks applied at the HTTP boundary before the ledger runs.

use crate::error::{LedgerError, Result};

pub const MAX_ORDER_SHARES: u32 = 100_000;

pub fn ticker(ticker: &str) -> Result<()> {
    let len = ticker.chars().count();
    if !(3..=10).contains(&len) {
        return Err(LedgerError::Validation(
            "ticker should be a string of length between 3 - 10".into(),
        ));
    }
    Ok(())
}

pub fn share_count(count: u32) -> Result<()> {
    int_range("shareCount", count, 1, MAX_ORDER_SHARES)
}

pub fn mobile(mobile: &str) -> Result<()> {
    if mobile.len() != 10 || !mobile.chars().all(|c| c.is_ascii_digit()) {
        return Err(LedgerError::Validation(
            "mobile should be a 10 digit number".into(),
        ));
    }
    Ok(())
}

pub fn int_range(field: &str, value: u32, min: u32, max: u32) -> Result<()> {
    if value < min || value > max {
        return Err(LedgerError::Validation(format!(
            "{} should be between {} and {}",
            field, min, max
        )));
    }
    Ok(())
}
