// src/replay.rs
//! Holding arithmetic.
//!
//! Every change to a holding's cost basis goes through [`apply_event`]; the
//! settlement engine feeds it live orders and [`calculate_holdings`] feeds it
//! the stored transaction history to rebuild a holding from scratch.

use crate::error::{LedgerError, Result};
use crate::models::{Holding, Transaction, TransactionType};
use chrono::{DateTime, Utc};
use serde::Serialize;

const EPSILON: f64 = 1e-9;

/// Aggregate position in one security, counting pending and usable shares together.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub share_count: f64,
    pub average_price: f64,
    pub total_returns: f64,
}

impl Position {
    pub fn of(holding: &Holding) -> Self {
        Self {
            share_count: holding.shares.total(),
            average_price: holding.average_price,
            total_returns: holding.total_returns,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HoldingEvent {
    Buy { count: f64, price: f64 },
    /// `cost_basis` is the average price the sale is measured against.
    Sell { count: f64, price: f64, cost_basis: f64 },
    UndoBuy { count: f64, price: f64 },
    UndoSell { count: f64, price: f64, cost_basis: f64 },
}

pub fn apply_event(pos: Position, event: HoldingEvent) -> Result<Position> {
    let mut next = pos;
    match event {
        HoldingEvent::Buy { count, price } => {
            let shares = pos.share_count + count;
            next.average_price = if shares > EPSILON {
                (pos.share_count * pos.average_price + count * price) / shares
            } else {
                0.0
            };
            next.share_count = shares;
        }
        HoldingEvent::Sell {
            count,
            price,
            cost_basis,
        } => {
            if pos.share_count + EPSILON < count {
                return Err(LedgerError::InsufficientShares {
                    requested: count,
                    available: pos.share_count,
                });
            }
            next.total_returns += (price - cost_basis) * count;
            next.share_count = (pos.share_count - count).max(0.0);
        }
        HoldingEvent::UndoBuy { count, price } => {
            if pos.share_count + EPSILON < count {
                return Err(LedgerError::InsufficientShares {
                    requested: count,
                    available: pos.share_count,
                });
            }
            let remaining = (pos.share_count - count).max(0.0);
            next.average_price = if remaining > EPSILON {
                (pos.share_count * pos.average_price - count * price) / remaining
            } else {
                0.0
            };
            next.share_count = remaining;
        }
        HoldingEvent::UndoSell {
            count,
            price,
            cost_basis,
        } => {
            let shares = pos.share_count + count;
            next.average_price = if shares > EPSILON {
                (pos.share_count * pos.average_price + count * cost_basis) / shares
            } else {
                0.0
            };
            next.total_returns -= (price - cost_basis) * count;
            next.share_count = shares;
        }
    }
    Ok(next)
}

/// Holding state rebuilt from history.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reconstruction {
    pub position: Position,
    /// Shares from buys whose lock window has not passed at replay time.
    pub locked_shares: f64,
    pub locked_till: Option<DateTime<Utc>>,
}

impl Reconstruction {
    /// Overwrites the cached projection on `holding` with the replayed values.
    pub fn apply_to(&self, holding: &mut Holding) {
        holding.average_price = self.position.average_price;
        holding.total_returns = self.position.total_returns;
        holding.shares.pending = self.locked_shares;
        holding.shares.usable = self.position.share_count - self.locked_shares;
        holding.shares.pending_until = self.locked_till;
    }

    /// True when `holding` agrees with the replay within floating point tolerance.
    pub fn matches(&self, holding: &Holding) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0);
        close(self.position.share_count, holding.shares.total())
            && close(self.position.average_price, holding.average_price)
            && close(self.position.total_returns, holding.total_returns)
    }
}

fn ordered<'a>(
    user: &str,
    ticker: &str,
    transactions: &'a [Transaction],
    skip: Option<&str>,
) -> Vec<&'a Transaction> {
    let mut history: Vec<&Transaction> = transactions
        .iter()
        .filter(|t| t.user == user && t.ticker == ticker)
        .filter(|t| Some(t.id.as_str()) != skip)
        .collect();
    history.sort_by_key(|t| t.created_at);
    history
}

fn replay_step(pos: Position, tx: &Transaction) -> Result<Position> {
    let event = match tx.kind {
        TransactionType::Buy => HoldingEvent::Buy {
            count: tx.share_count,
            price: tx.exchange_price,
        },
        TransactionType::Sell => HoldingEvent::Sell {
            count: tx.share_count,
            price: tx.exchange_price,
            cost_basis: pos.average_price,
        },
    };
    apply_event(pos, event).map_err(|_| {
        LedgerError::InvalidTransactionSet(format!(
            "transaction {} sells {} {} but only {} held",
            tx.id, tx.share_count, tx.ticker, pos.share_count
        ))
    })
}

/// Replays the `(user, ticker)` history in creation order, skipping `skip`.
///
/// Sells are measured against the running average, so the result is the
/// ground truth the incremental settlement path must agree with.
pub fn calculate_holdings(
    user: &str,
    ticker: &str,
    transactions: &[Transaction],
    skip: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Reconstruction> {
    let mut out = Reconstruction::default();
    for tx in ordered(user, ticker, transactions, skip) {
        out.position = replay_step(out.position, tx)?;
        if tx.kind == TransactionType::Buy && now <= tx.unlocked_till {
            out.locked_shares += tx.share_count;
            out.locked_till = out.locked_till.max(Some(tx.unlocked_till));
        }
    }
    out.locked_shares = out.locked_shares.min(out.position.share_count);
    Ok(out)
}

/// Running average price of the holding just before transaction `id`.
pub fn average_before(
    user: &str,
    ticker: &str,
    transactions: &[Transaction],
    id: &str,
) -> Result<f64> {
    let mut pos = Position::default();
    for tx in ordered(user, ticker, transactions, None) {
        if tx.id == id {
            return Ok(pos.average_price);
        }
        pos = replay_step(pos, tx)?;
    }
    Err(LedgerError::UnknownTransaction(id.to_string()))
}
