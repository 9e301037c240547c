// src/settlement.rs
//! Transaction settlement engine.
//!
//! Functions here are pure: they take the current user, holding and security,
//! check the business rules and return the states to persist. Nothing is
//! written unless every rule passed.

use crate::error::{LedgerError, Result};
use crate::lock::next_settlement_boundary;
use crate::models::{Holding, Security, Transaction, TransactionType, User};
use crate::replay::{apply_event, HoldingEvent, Position};
use chrono::{DateTime, Utc};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub user: User,
    pub holding: Holding,
    pub security: Security,
}

fn check_matches(
    user: &User,
    holding: &Holding,
    security: &Security,
    tx: &Transaction,
) -> Result<()> {
    if security.ticker != tx.ticker || holding.ticker != tx.ticker {
        return Err(LedgerError::Validation(format!(
            "transaction {} is for {}, got security {} and holding {}",
            tx.id, tx.ticker, security.ticker, holding.ticker
        )));
    }
    if user.id != tx.user || holding.user != tx.user {
        return Err(LedgerError::Validation(format!(
            "transaction {} belongs to another user",
            tx.id
        )));
    }
    Ok(())
}

fn set_position(holding: &mut Holding, pos: Position) {
    holding.average_price = pos.average_price;
    holding.total_returns = pos.total_returns;
}

fn release_float(security: &mut Security, count: f64) -> Result<()> {
    let for_sale = security.shares_for_sale + count;
    if for_sale > security.total_shares + EPSILON {
        return Err(LedgerError::FloatOverflow {
            ticker: security.ticker.clone(),
            total: security.total_shares,
        });
    }
    security.shares_for_sale = for_sale;
    Ok(())
}

fn take_float(security: &mut Security, count: f64) -> Result<()> {
    if security.shares_for_sale + EPSILON < count {
        return Err(LedgerError::InsufficientFloat {
            requested: count,
            available: security.shares_for_sale,
        });
    }
    security.shares_for_sale = (security.shares_for_sale - count).max(0.0);
    Ok(())
}

/// Applies a proposed transaction.
///
/// Bought shares and sale proceeds land in the pending buckets until
/// `tx.unlocked_till`. Sales are measured against `tx.average_price`, the
/// cost basis captured when the order was placed.
pub fn apply_transaction(
    user: &User,
    holding: &Holding,
    security: &Security,
    tx: &Transaction,
) -> Result<Settlement> {
    check_matches(user, holding, security, tx)?;
    let mut user = user.clone();
    let mut holding = holding.clone();
    let mut security = security.clone();
    let count = tx.share_count;
    let value = tx.value();

    match tx.kind {
        TransactionType::Buy => {
            if user.funds.usable < value {
                return Err(LedgerError::InsufficientFunds {
                    required: value,
                    available: user.funds.usable,
                });
            }
            take_float(&mut security, count)?;
            let pos = apply_event(
                Position::of(&holding),
                HoldingEvent::Buy {
                    count,
                    price: tx.exchange_price,
                },
            )?;
            set_position(&mut holding, pos);
            holding.shares.lock(count, tx.unlocked_till);
            user.funds.usable -= value;
        }
        TransactionType::Sell => {
            holding
                .shares
                .withdraw(count)
                .map_err(|available| LedgerError::InsufficientShares {
                    requested: count,
                    available,
                })?;
            let pos = apply_event(
                Position {
                    share_count: holding.shares.total() + count,
                    ..Position::of(&holding)
                },
                HoldingEvent::Sell {
                    count,
                    price: tx.exchange_price,
                    cost_basis: tx.average_price,
                },
            )?;
            set_position(&mut holding, pos);
            user.total_returns += (tx.exchange_price - tx.average_price) * count;
            user.funds.lock(value, tx.unlocked_till);
            release_float(&mut security, count)?;
        }
    }

    Ok(Settlement {
        user,
        holding,
        security,
    })
}

/// Reverses a previously applied transaction once its lock window has passed.
///
/// The transaction record itself is left alone; callers delete or rewrite it.
pub fn revert_transaction(
    user: &User,
    holding: &Holding,
    security: &Security,
    tx: &Transaction,
    now: DateTime<Utc>,
) -> Result<Settlement> {
    check_matches(user, holding, security, tx)?;
    if now <= tx.unlocked_till {
        return Err(LedgerError::Locked {
            until: tx.unlocked_till,
        });
    }
    let mut user = user.clone();
    let mut holding = holding.clone();
    let mut security = security.clone();
    let count = tx.share_count;
    let value = tx.value();

    match tx.kind {
        TransactionType::Buy => {
            let pos = apply_event(
                Position::of(&holding),
                HoldingEvent::UndoBuy {
                    count,
                    price: tx.exchange_price,
                },
            )?;
            holding
                .shares
                .reclaim(count)
                .map_err(|available| LedgerError::InsufficientShares {
                    requested: count,
                    available,
                })?;
            set_position(&mut holding, pos);
            user.funds.usable += value;
            release_float(&mut security, count)?;
        }
        TransactionType::Sell => {
            let pos = apply_event(
                Position::of(&holding),
                HoldingEvent::UndoSell {
                    count,
                    price: tx.exchange_price,
                    cost_basis: tx.average_price,
                },
            )?;
            user.funds
                .reclaim(value)
                .map_err(|available| LedgerError::InsufficientFunds {
                    required: value,
                    available,
                })?;
            user.total_returns -= (tx.exchange_price - tx.average_price) * count;
            holding.shares.usable += count;
            set_position(&mut holding, pos);
            take_float(&mut security, count)?;
        }
    }

    Ok(Settlement {
        user,
        holding,
        security,
    })
}

/// Revert, rewrite `kind`/`share_count`, then re-apply against the reverted state.
///
/// The re-applied order keeps its exchange price, captures the reverted
/// holding's average price and settles at the next boundary after `now`. On
/// error nothing has changed, so the caller's copy of `tx` still carries the
/// prior values.
pub fn update_transaction(
    user: &User,
    holding: &Holding,
    security: &Security,
    tx: &Transaction,
    kind: TransactionType,
    share_count: f64,
    now: DateTime<Utc>,
) -> Result<(Settlement, Transaction)> {
    let reverted = revert_transaction(user, holding, security, tx, now)?;
    let mut updated = tx.clone();
    updated.kind = kind;
    updated.share_count = share_count;
    updated.average_price = reverted.holding.average_price;
    updated.unlocked_till = next_settlement_boundary(now);
    let settled = apply_transaction(
        &reverted.user,
        &reverted.holding,
        &reverted.security,
        &updated,
    )?;
    Ok((settled, updated))
}

/// Pays out a whole position at `price` and closes it. Returns the proceeds.
pub fn close_position(user: &mut User, holding: &mut Holding, price: f64) -> f64 {
    let shares = holding.shares.total();
    let proceeds = shares * price;
    let profit = (price - holding.average_price) * shares;
    user.funds.usable += proceeds;
    user.total_returns += profit;
    holding.total_returns += profit;
    holding.shares.usable = 0.0;
    holding.shares.pending = 0.0;
    holding.shares.pending_until = None;
    holding.average_price = 0.0;
    proceeds
}
