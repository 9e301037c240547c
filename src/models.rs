// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A balance split into a usable part and a part pending settlement.
///
/// Funds on a user and shares on a holding share this shape; `pending` is
/// merged into `usable` by `promote` once `pending_until` has passed.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockedBalance {
    pub usable: f64,
    pub pending: f64,
    pub pending_until: Option<DateTime<Utc>>,
}

impl LockedBalance {
    pub fn total(&self) -> f64 {
        self.usable + self.pending
    }

    /// Adds `amount` to the pending bucket and moves the window to `until`.
    pub fn lock(&mut self, amount: f64, until: DateTime<Utc>) {
        self.pending += amount;
        self.pending_until = Some(until);
    }

    /// Removes `amount` from the usable bucket, failing with the available amount.
    pub fn withdraw(&mut self, amount: f64) -> Result<(), f64> {
        if self.usable < amount {
            return Err(self.usable);
        }
        self.usable -= amount;
        Ok(())
    }

    /// Takes back `amount` that was previously credited, usable first, then pending.
    pub fn reclaim(&mut self, amount: f64) -> Result<(), f64> {
        if self.total() < amount {
            return Err(self.total());
        }
        let from_usable = amount.min(self.usable);
        self.usable -= from_usable;
        self.pending -= amount - from_usable;
        Ok(())
    }

    /// Merges the pending bucket into usable when the window has passed.
    /// Returns whether anything changed.
    pub fn promote(&mut self, now: DateTime<Utc>) -> bool {
        match self.pending_until {
            Some(until) if now > until => {
                self.usable += self.pending;
                self.pending = 0.0;
                self.pending_until = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub mobile: String,
    pub user_name: Option<String>,
    pub funds: LockedBalance,
    pub total_returns: f64,
    pub last_seen: DateTime<Utc>,
}

impl User {
    pub fn new(mobile: &str, user_name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mobile: mobile.to_string(),
            user_name,
            funds: LockedBalance::default(),
            total_returns: 0.0,
            last_seen: now,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    pub ticker: String,
    pub total_shares: f64,
    pub shares_for_sale: f64,
    pub current_price: f64,
}

impl Security {
    pub fn new(ticker: &str, total_shares: f64, current_price: f64) -> Self {
        Self {
            ticker: ticker.to_string(),
            total_shares,
            shares_for_sale: total_shares,
            current_price,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub user: String,
    pub ticker: String,
    pub shares: LockedBalance,
    pub average_price: f64,
    pub total_returns: f64,
}

impl Holding {
    pub fn empty(user: &str, ticker: &str) -> Self {
        Self {
            user: user.to_string(),
            ticker: ticker.to_string(),
            shares: LockedBalance::default(),
            average_price: 0.0,
            total_returns: 0.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Buy => write!(f, "BUY"),
            TransactionType::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TransactionType::Buy),
            "SELL" => Ok(TransactionType::Sell),
            other => Err(format!("unknown transaction type {}", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub user: String,
    pub ticker: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub share_count: f64,
    pub exchange_price: f64,
    /// Holding average price when the order was placed.
    pub average_price: f64,
    pub unlocked_till: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn value(&self) -> f64 {
        self.share_count * self.exchange_price
    }
}
