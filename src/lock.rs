// src/lock.rs
use crate::models::{Holding, LockedBalance, User};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::info;

/// Entities that carry a pending sub-balance.
pub trait Lockable {
    fn balance_mut(&mut self) -> &mut LockedBalance;
    fn label(&self) -> String;
}

impl Lockable for User {
    fn balance_mut(&mut self) -> &mut LockedBalance {
        &mut self.funds
    }

    fn label(&self) -> String {
        format!("funds of user {}", self.id)
    }
}

impl Lockable for Holding {
    fn balance_mut(&mut self) -> &mut LockedBalance {
        &mut self.shares
    }

    fn label(&self) -> String {
        format!("{} shares of user {}", self.ticker, self.user)
    }
}

/// Start of the next UTC day. Anything bought or sold today settles then.
pub fn next_settlement_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&midnight)
}

/// Promotes the pending balance into usable when its window has passed.
/// Returns true when the entity changed and needs to be written back.
pub fn unlock_if_due<T: Lockable>(entity: &mut T, now: DateTime<Utc>) -> bool {
    let label = entity.label();
    let balance = entity.balance_mut();
    let pending = balance.pending;
    if balance.promote(now) {
        info!("Unlocked {} of {}", pending, label);
        true
    } else {
        false
    }
}
