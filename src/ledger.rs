// src/ledger.rs
use crate::db::Store;
use crate::error::{LedgerError, Result};
use crate::lock::{next_settlement_boundary, unlock_if_due};
use crate::models::{Holding, Security, Transaction, TransactionType, User};
use crate::replay::{average_before, calculate_holdings};
use crate::settlement::{self, Settlement};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const LIST_LIMIT: usize = 50;

enum HistoryEdit<'a> {
    Replace(&'a mut Transaction),
    Remove(&'a str),
}

/// Async mutex per key. Callers take the ticker key before the user key.
#[derive(Default)]
struct KeyLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: String) -> OwnedMutexGuard<()> {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
            table.entry(key).or_default().clone()
        };
        slot.lock_owned().await
    }
}

fn ticker_key(ticker: &str) -> String {
    format!("ticker:{}", ticker)
}

fn user_key(user: &str) -> String {
    format!("user:{}", user)
}

pub struct Ledger {
    store: Arc<dyn Store>,
    locks: KeyLocks,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: KeyLocks::default(),
        }
    }

    async fn load_user(&self, id: &str) -> Result<User> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| LedgerError::UnknownUser(id.to_string()))
    }

    async fn load_security(&self, ticker: &str) -> Result<Security> {
        self.store
            .get_security(ticker)
            .await?
            .ok_or_else(|| LedgerError::UnknownTicker(ticker.to_string()))
    }

    async fn load_holding(&self, user: &str, ticker: &str) -> Result<Holding> {
        Ok(self
            .store
            .get_holding(user, ticker)
            .await?
            .unwrap_or_else(|| Holding::empty(user, ticker)))
    }

    async fn load_transaction(&self, user: &str, id: &str) -> Result<Transaction> {
        self.store
            .get_transaction(user, id)
            .await?
            .ok_or_else(|| LedgerError::UnknownTransaction(id.to_string()))
    }

    async fn unlock_user(&self, user: &mut User, now: DateTime<Utc>) -> Result<()> {
        if unlock_if_due(user, now) {
            self.store.save_user(user).await?;
        }
        Ok(())
    }

    async fn unlock_holding(&self, holding: &mut Holding, now: DateTime<Utc>) -> Result<()> {
        if unlock_if_due(holding, now) {
            self.store.save_holding(holding).await?;
        }
        Ok(())
    }

    /// Writes `after`. If a write fails, the entities already written are put
    /// back to `before` and a processing error is returned.
    async fn commit(&self, before: &Settlement, after: &Settlement) -> Result<()> {
        let mut written = 0;
        let outcome = async {
            self.store.save_holding(&after.holding).await?;
            written += 1;
            self.store.save_user(&after.user).await?;
            written += 1;
            self.store.save_security(&after.security).await
        }
        .await;

        if let Err(e) = outcome {
            error!("Settlement write failed after {} of 3 writes: {}", written, e);
            if written >= 1 {
                if let Err(e) = self.store.save_holding(&before.holding).await {
                    error!("Failed to restore holding: {}", e);
                }
            }
            if written >= 2 {
                if let Err(e) = self.store.save_user(&before.user).await {
                    error!("Failed to restore user: {}", e);
                }
            }
            return Err(LedgerError::Processing(e.to_string()));
        }
        Ok(())
    }

    /// Rebuilds `holding` from the history of `(user, ticker)`.
    async fn replay_holding(&self, holding: &mut Holding, now: DateTime<Utc>) -> Result<()> {
        let history = self.store.list_transactions(&holding.user).await?;
        let rebuilt = calculate_holdings(&holding.user, &holding.ticker, &history, None, now)?;
        if !rebuilt.matches(holding) {
            warn!(
                "Holding {} of user {} drifted from history: cached {:?}, replayed {:?}",
                holding.ticker, holding.user, holding, rebuilt.position
            );
        }
        rebuilt.apply_to(holding);
        Ok(())
    }

    /// Rebuilds `after.holding` from history with `edit` applied and moves the
    /// user's realised returns by exactly what the replay moved.
    ///
    /// A replaced transaction takes its cost basis from the running average at
    /// its place in history.
    async fn replay_edit(
        &self,
        before: &Settlement,
        after: &mut Settlement,
        edit: HistoryEdit<'_>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let user = after.holding.user.clone();
        let ticker = after.holding.ticker.clone();
        let mut history = self.store.list_transactions(&user).await?;
        let current = calculate_holdings(&user, &ticker, &history, None, now)?;
        if !current.matches(&before.holding) {
            warn!(
                "Holding {} of user {} drifted from history: cached {:?}, replayed {:?}",
                ticker, user, before.holding, current.position
            );
        }

        let skip = match edit {
            HistoryEdit::Replace(updated) => {
                updated.average_price = average_before(&user, &ticker, &history, &updated.id)?;
                for tx in history.iter_mut().filter(|t| t.id == updated.id) {
                    *tx = updated.clone();
                }
                None
            }
            HistoryEdit::Remove(id) => Some(id),
        };
        let rebuilt = calculate_holdings(&user, &ticker, &history, skip, now)?;
        rebuilt.apply_to(&mut after.holding);
        after.user.total_returns = before.user.total_returns + rebuilt.position.total_returns
            - current.position.total_returns;
        Ok(())
    }

    pub async fn login(
        &self,
        mobile: &str,
        user_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let _guard = self.locks.acquire(format!("mobile:{}", mobile)).await;
        match self.store.find_user_by_mobile(mobile).await? {
            Some(mut user) => {
                let _user_guard = self.locks.acquire(user_key(&user.id)).await;
                unlock_if_due(&mut user, now);
                user.last_seen = now;
                if user_name.is_some() {
                    user.user_name = user_name;
                }
                self.store.save_user(&user).await?;
                Ok(user)
            }
            None => {
                let user = User::new(mobile, user_name, now);
                self.store.insert_user(&user).await?;
                info!("Created user {} for mobile {}", user.id, mobile);
                Ok(user)
            }
        }
    }

    pub async fn profile(&self, user_id: &str, now: DateTime<Utc>) -> Result<User> {
        let _guard = self.locks.acquire(user_key(user_id)).await;
        let mut user = self.load_user(user_id).await?;
        self.unlock_user(&mut user, now).await?;
        Ok(user)
    }

    pub async fn top_up(&self, user_id: &str, amount: f64, now: DateTime<Utc>) -> Result<User> {
        let _guard = self.locks.acquire(user_key(user_id)).await;
        let mut user = self.load_user(user_id).await?;
        unlock_if_due(&mut user, now);
        user.funds.usable += amount;
        self.store.save_user(&user).await?;
        info!("User {} topped up {}", user_id, amount);
        Ok(user)
    }

    pub async fn create_security(
        &self,
        ticker: &str,
        total_shares: f64,
        current_price: f64,
    ) -> Result<Security> {
        let _guard = self.locks.acquire(ticker_key(ticker)).await;
        let security = Security::new(ticker, total_shares, current_price);
        self.store.insert_security(&security).await?;
        info!("Security {} created with {} shares", ticker, total_shares);
        Ok(security)
    }

    pub async fn securities(&self) -> Result<Vec<Security>> {
        self.store.list_securities(LIST_LIMIT).await
    }

    pub async fn update_price(&self, ticker: &str, price: f64) -> Result<Security> {
        let _guard = self.locks.acquire(ticker_key(ticker)).await;
        let mut security = self.load_security(ticker).await?;
        security.current_price = price;
        self.store.save_security(&security).await?;
        info!("Price of {} set to {}", ticker, price);
        Ok(security)
    }

    /// Settles every open position at the current price, then removes the security.
    ///
    /// Each payout is recorded as a closing sale so replay sees the position end.
    pub async fn delete_security(&self, ticker: &str, now: DateTime<Utc>) -> Result<Security> {
        let _guard = self.locks.acquire(ticker_key(ticker)).await;
        let security = self.load_security(ticker).await?;
        for holding in self.store.list_holdings_by_ticker(ticker).await? {
            if holding.shares.total() <= 0.0 {
                continue;
            }
            let _user_guard = self.locks.acquire(user_key(&holding.user)).await;
            let mut user = self.load_user(&holding.user).await?;
            unlock_if_due(&mut user, now);
            let before = Settlement {
                user,
                holding,
                security: security.clone(),
            };
            let mut after = before.clone();
            let closing = Transaction {
                id: uuid::Uuid::new_v4().to_string(),
                user: after.user.id.clone(),
                ticker: ticker.to_string(),
                kind: TransactionType::Sell,
                share_count: before.holding.shares.total(),
                exchange_price: security.current_price,
                average_price: before.holding.average_price,
                unlocked_till: now,
                created_at: now,
            };
            let paid = settlement::close_position(
                &mut after.user,
                &mut after.holding,
                security.current_price,
            );

            self.store.insert_transaction(&closing).await?;
            if let Err(e) = self.commit(&before, &after).await {
                error!("Failed to settle {} for user {}: {}", ticker, after.user.id, e);
                if let Err(de) = self.store.delete_transaction(&closing.user, &closing.id).await {
                    error!("Failed to remove closing transaction {}: {}", closing.id, de);
                }
                return Err(e);
            }
            info!("Closed {} position of user {} for {}", ticker, after.user.id, paid);
        }
        self.store.delete_security(ticker).await?;
        info!("Security {} deleted", ticker);
        Ok(security)
    }

    pub async fn holdings(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Holding>> {
        let _guard = self.locks.acquire(user_key(user_id)).await;
        let mut holdings = self.store.list_holdings_by_user(user_id).await?;
        for holding in holdings.iter_mut() {
            self.unlock_holding(holding, now).await?;
        }
        holdings.truncate(LIST_LIMIT);
        Ok(holdings)
    }

    pub async fn transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        self.store.list_transactions(user_id).await
    }

    pub async fn place_order(
        &self,
        user_id: &str,
        ticker: &str,
        kind: TransactionType,
        share_count: f64,
        now: DateTime<Utc>,
    ) -> Result<Transaction> {
        let _ticker_guard = self.locks.acquire(ticker_key(ticker)).await;
        let _user_guard = self.locks.acquire(user_key(user_id)).await;

        let security = self.load_security(ticker).await?;
        let mut user = self.load_user(user_id).await?;
        let mut holding = self.load_holding(user_id, ticker).await?;
        self.unlock_user(&mut user, now).await?;
        self.unlock_holding(&mut holding, now).await?;

        let tx = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            user: user_id.to_string(),
            ticker: ticker.to_string(),
            kind,
            share_count,
            exchange_price: security.current_price,
            average_price: holding.average_price,
            unlocked_till: next_settlement_boundary(now),
            created_at: now,
        };
        let after = settlement::apply_transaction(&user, &holding, &security, &tx).map_err(|e| {
            warn!("Rejected {} of {} {} for user {}: {}", kind, share_count, ticker, user_id, e);
            e
        })?;

        self.store.insert_transaction(&tx).await?;
        let before = Settlement {
            user,
            holding,
            security,
        };
        if let Err(e) = self.commit(&before, &after).await {
            if let Err(de) = self.store.delete_transaction(user_id, &tx.id).await {
                error!("Failed to remove orphaned transaction {}: {}", tx.id, de);
            }
            return Err(e);
        }
        info!(
            "Settled {} {} {} @ {} for user {}",
            kind, share_count, ticker, tx.exchange_price, user_id
        );
        Ok(tx)
    }

    /// Reverts `id`, rewrites its type and share count, and applies it again.
    /// If anything fails the stored record keeps its prior values.
    pub async fn update_transaction(
        &self,
        user_id: &str,
        id: &str,
        kind: TransactionType,
        share_count: f64,
        now: DateTime<Utc>,
    ) -> Result<Transaction> {
        let prior = self.load_transaction(user_id, id).await?;
        let _ticker_guard = self.locks.acquire(ticker_key(&prior.ticker)).await;
        let _user_guard = self.locks.acquire(user_key(user_id)).await;

        let prior = self.load_transaction(user_id, id).await?;
        let security = self.load_security(&prior.ticker).await?;
        let mut user = self.load_user(user_id).await?;
        let mut holding = self.load_holding(user_id, &prior.ticker).await?;
        self.unlock_user(&mut user, now).await?;
        self.unlock_holding(&mut holding, now).await?;

        let (mut after, mut updated) =
            settlement::update_transaction(&user, &holding, &security, &prior, kind, share_count, now)
                .map_err(|e| {
                    warn!("Rejected update of transaction {}: {}", id, e);
                    e
                })?;
        let before = Settlement {
            user,
            holding,
            security,
        };
        self.replay_edit(&before, &mut after, HistoryEdit::Replace(&mut updated), now)
            .await?;

        self.store.save_transaction(&updated).await?;
        if let Err(e) = self.commit(&before, &after).await {
            if let Err(re) = self.store.save_transaction(&prior).await {
                error!("Failed to restore transaction {}: {}", id, re);
            }
            return Err(e);
        }
        info!(
            "Transaction {} updated from {} {} to {} {}",
            id, prior.kind, prior.share_count, kind, share_count
        );
        Ok(updated)
    }

    /// Reverts and removes a transaction once its lock window has passed.
    pub async fn delete_transaction(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction> {
        let tx = self.load_transaction(user_id, id).await?;
        let _ticker_guard = self.locks.acquire(ticker_key(&tx.ticker)).await;
        let _user_guard = self.locks.acquire(user_key(user_id)).await;

        let tx = self.load_transaction(user_id, id).await?;
        let security = self.load_security(&tx.ticker).await?;
        let mut user = self.load_user(user_id).await?;
        let mut holding = self.load_holding(user_id, &tx.ticker).await?;
        self.unlock_user(&mut user, now).await?;
        self.unlock_holding(&mut holding, now).await?;

        let mut after = settlement::revert_transaction(&user, &holding, &security, &tx, now)
            .map_err(|e| {
                warn!("Rejected delete of transaction {}: {}", id, e);
                e
            })?;
        let before = Settlement {
            user,
            holding,
            security,
        };
        self.replay_edit(&before, &mut after, HistoryEdit::Remove(id), now)
            .await?;

        self.commit(&before, &after).await?;
        if let Err(e) = self.store.delete_transaction(user_id, id).await {
            error!("Failed to delete transaction {}: {}", id, e);
            if let Err(re) = self.commit(&after, &before).await {
                error!("Failed to restore balances for transaction {}: {}", id, re);
            }
            return Err(LedgerError::Processing(e.to_string()));
        }
        info!("Transaction {} of user {} deleted", id, user_id);
        Ok(tx)
    }

    /// Rebuilds a holding from the transaction history and stores the result.
    pub async fn reconcile_holding(
        &self,
        user_id: &str,
        ticker: &str,
        now: DateTime<Utc>,
    ) -> Result<Holding> {
        let _ticker_guard = self.locks.acquire(ticker_key(ticker)).await;
        let _user_guard = self.locks.acquire(user_key(user_id)).await;
        let mut holding = self.load_holding(user_id, ticker).await?;
        self.replay_holding(&mut holding, now).await?;
        self.store.save_holding(&holding).await?;
        Ok(holding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn day(n: i64) -> DateTime<Utc> {
        let start: DateTime<Utc> = "2024-07-01T11:00:00Z".parse().unwrap();
        start + Duration::days(n)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    async fn setup(store: Arc<dyn Store>, funds: f64) -> (Ledger, User) {
        let ledger = Ledger::new(store);
        let user = ledger.login("9876543210", None, day(0)).await.unwrap();
        ledger.top_up(&user.id, funds, day(0)).await.unwrap();
        ledger.create_security("tcs", 10000.0, 1000.0).await.unwrap();
        (ledger, user)
    }

    async fn holding(ledger: &Ledger, user: &str) -> Holding {
        ledger.load_holding(user, "tcs").await.unwrap()
    }

    #[tokio::test]
    async fn login_creates_user_once() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()));
        let first = ledger
            .login("9876543210", Some("asha".into()), day(0))
            .await
            .unwrap();
        let again = ledger.login("9876543210", None, day(1)).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.user_name.as_deref(), Some("asha"));
        assert_eq!(again.last_seen, day(1));
    }

    #[tokio::test]
    async fn average_price_across_price_change() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        ledger.update_price("tcs", 500.0).await.unwrap();
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 5.0, day(0))
            .await
            .unwrap();

        let profile = ledger.profile(&user.id, day(0)).await.unwrap();
        assert_eq!(profile.funds.usable, 87500.0);
        let h = holding(&ledger, &user.id).await;
        assert!(close(h.average_price, 833.333333));
        assert_eq!(h.shares.total(), 15.0);
    }

    #[tokio::test]
    async fn sell_after_unlock_credits_locked_funds() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        ledger.update_price("tcs", 500.0).await.unwrap();

        let early = ledger
            .place_order(&user.id, "tcs", TransactionType::Sell, 5.0, day(0))
            .await;
        assert!(matches!(early, Err(LedgerError::InsufficientShares { .. })));

        let sell = ledger
            .place_order(&user.id, "tcs", TransactionType::Sell, 5.0, day(1))
            .await
            .unwrap();
        assert_eq!(sell.average_price, 1000.0);

        let profile = ledger.profile(&user.id, day(1)).await.unwrap();
        assert_eq!(profile.funds.usable, 90000.0);
        assert_eq!(profile.funds.pending, 2500.0);
        assert_eq!(profile.total_returns, -2500.0);
        let h = holding(&ledger, &user.id).await;
        assert_eq!(h.average_price, 1000.0);
        assert_eq!(h.shares.usable, 5.0);

        let next_day = ledger.profile(&user.id, day(2)).await.unwrap();
        assert_eq!(next_day.funds.usable, 92500.0);
        assert_eq!(next_day.funds.pending, 0.0);
    }

    #[tokio::test]
    async fn unknown_ticker_and_user_are_rejected() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100.0).await;
        assert!(matches!(
            ledger
                .place_order(&user.id, "nope", TransactionType::Buy, 1.0, day(0))
                .await,
            Err(LedgerError::UnknownTicker(_))
        ));
        assert!(matches!(
            ledger
                .place_order("ghost", "tcs", TransactionType::Buy, 1.0, day(0))
                .await,
            Err(LedgerError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_locked_on_the_same_day() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        let tx = ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        let err = ledger
            .delete_transaction(&user.id, &tx.id, day(0))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Locked { .. }));
        assert_eq!(ledger.transactions(&user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_restores_balances_and_removes_record() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 20.0, day(0))
            .await
            .unwrap();
        ledger.update_price("tcs", 1500.0).await.unwrap();
        let sell = ledger
            .place_order(&user.id, "tcs", TransactionType::Sell, 8.0, day(1))
            .await
            .unwrap();

        let removed = ledger
            .delete_transaction(&user.id, &sell.id, day(2))
            .await
            .unwrap();
        assert_eq!(removed.id, sell.id);

        let profile = ledger.profile(&user.id, day(2)).await.unwrap();
        assert_eq!(profile.funds.total(), 80000.0);
        assert!(close(profile.total_returns, 0.0));
        let h = holding(&ledger, &user.id).await;
        assert_eq!(h.shares.usable, 20.0);
        assert_eq!(h.average_price, 1000.0);
        assert!(close(h.total_returns, 0.0));
        let security = ledger.load_security("tcs").await.unwrap();
        assert_eq!(security.shares_for_sale, 9980.0);
        assert!(ledger.transactions(&user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_that_breaks_history_is_rejected() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        let buy = ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        ledger
            .place_order(&user.id, "tcs", TransactionType::Sell, 10.0, day(1))
            .await
            .unwrap();
        let err = ledger
            .delete_transaction(&user.id, &buy.id, day(2))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientShares { .. }));
        assert_eq!(ledger.transactions(&user.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_reapplies_with_new_values() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        let buy = ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        let updated = ledger
            .update_transaction(&user.id, &buy.id, TransactionType::Buy, 30.0, day(1))
            .await
            .unwrap();
        assert_eq!(updated.share_count, 30.0);
        assert_eq!(updated.created_at, buy.created_at);

        let stored = ledger.load_transaction(&user.id, &buy.id).await.unwrap();
        assert_eq!(stored, updated);
        let profile = ledger.profile(&user.id, day(1)).await.unwrap();
        assert_eq!(profile.funds.usable, 70000.0);
        let h = holding(&ledger, &user.id).await;
        assert_eq!(h.shares.pending, 30.0);
        assert_eq!(h.shares.usable, 0.0);
    }

    #[tokio::test]
    async fn rejected_update_keeps_prior_record() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 10000.0).await;
        let buy = ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        let err = ledger
            .update_transaction(&user.id, &buy.id, TransactionType::Buy, 50.0, day(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        let stored = ledger.load_transaction(&user.id, &buy.id).await.unwrap();
        assert_eq!(stored, buy);
        let profile = ledger.profile(&user.id, day(1)).await.unwrap();
        assert_eq!(profile.funds.usable, 0.0);
        assert_eq!(holding(&ledger, &user.id).await.shares.usable, 10.0);
    }

    #[tokio::test]
    async fn replay_matches_live_holding() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 1_000_000.0).await;
        let orders = [
            (TransactionType::Buy, 40.0, 900.0, 0),
            (TransactionType::Buy, 10.0, 1200.0, 0),
            (TransactionType::Sell, 25.0, 1500.0, 1),
            (TransactionType::Buy, 5.0, 700.0, 2),
            (TransactionType::Sell, 12.0, 650.0, 3),
        ];
        for (kind, count, price, d) in orders {
            ledger.update_price("tcs", price).await.unwrap();
            ledger
                .place_order(&user.id, "tcs", kind, count, day(d))
                .await
                .unwrap();
        }
        let live = holding(&ledger, &user.id).await;
        let history = ledger.transactions(&user.id).await.unwrap();
        let replayed = calculate_holdings(&user.id, "tcs", &history, None, day(3)).unwrap();

        assert!(close(replayed.position.share_count, live.shares.total()));
        assert!(close(replayed.position.average_price, live.average_price));
        assert!(close(replayed.position.total_returns, live.total_returns));

        let reconciled = ledger.reconcile_holding(&user.id, "tcs", day(3)).await.unwrap();
        assert!(close(reconciled.shares.total(), 18.0));
    }

    #[tokio::test]
    async fn deleting_security_pays_out_holders() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        ledger.update_price("tcs", 1200.0).await.unwrap();
        ledger.delete_security("tcs", day(0)).await.unwrap();

        let profile = ledger.profile(&user.id, day(0)).await.unwrap();
        assert_eq!(profile.funds.usable, 102000.0);
        assert_eq!(profile.total_returns, 2000.0);
        let h = holding(&ledger, &user.id).await;
        assert_eq!(h.shares.total(), 0.0);
        assert!(ledger.securities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_buys_are_serialised() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        let ledger = Arc::new(ledger);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            let id = user.id.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .place_order(&id, "tcs", TransactionType::Buy, 2.0, day(0))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let profile = ledger.profile(&user.id, day(0)).await.unwrap();
        assert_eq!(profile.funds.usable, 60000.0);
        assert_eq!(holding(&ledger, &user.id).await.shares.pending, 40.0);
        assert_eq!(
            ledger.load_security("tcs").await.unwrap().shares_for_sale,
            9960.0
        );
    }

    /// Delegates to a `MemoryStore` but can be told to fail individual writes.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_security_saves: AtomicBool,
        fail_holding_saves: AtomicBool,
        fail_user_saves: AtomicBool,
        fail_transaction_deletes: AtomicBool,
    }

    fn unavailable(flag: &AtomicBool, table: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage(format!("{} table unavailable", table)));
        }
        Ok(())
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get_user(&self, id: &str) -> Result<Option<User>> {
            self.inner.get_user(id).await
        }
        async fn find_user_by_mobile(&self, mobile: &str) -> Result<Option<User>> {
            self.inner.find_user_by_mobile(mobile).await
        }
        async fn insert_user(&self, user: &User) -> Result<()> {
            self.inner.insert_user(user).await
        }
        async fn save_user(&self, user: &User) -> Result<()> {
            unavailable(&self.fail_user_saves, "user")?;
            self.inner.save_user(user).await
        }
        async fn get_security(&self, ticker: &str) -> Result<Option<Security>> {
            self.inner.get_security(ticker).await
        }
        async fn list_securities(&self, limit: usize) -> Result<Vec<Security>> {
            self.inner.list_securities(limit).await
        }
        async fn insert_security(&self, security: &Security) -> Result<()> {
            self.inner.insert_security(security).await
        }
        async fn save_security(&self, security: &Security) -> Result<()> {
            unavailable(&self.fail_security_saves, "security")?;
            self.inner.save_security(security).await
        }
        async fn delete_security(&self, ticker: &str) -> Result<()> {
            self.inner.delete_security(ticker).await
        }
        async fn get_holding(&self, user: &str, ticker: &str) -> Result<Option<Holding>> {
            self.inner.get_holding(user, ticker).await
        }
        async fn list_holdings_by_user(&self, user: &str) -> Result<Vec<Holding>> {
            self.inner.list_holdings_by_user(user).await
        }
        async fn list_holdings_by_ticker(&self, ticker: &str) -> Result<Vec<Holding>> {
            self.inner.list_holdings_by_ticker(ticker).await
        }
        async fn save_holding(&self, holding: &Holding) -> Result<()> {
            unavailable(&self.fail_holding_saves, "holding")?;
            self.inner.save_holding(holding).await
        }
        async fn get_transaction(&self, user: &str, id: &str) -> Result<Option<Transaction>> {
            self.inner.get_transaction(user, id).await
        }
        async fn list_transactions(&self, user: &str) -> Result<Vec<Transaction>> {
            self.inner.list_transactions(user).await
        }
        async fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
            self.inner.insert_transaction(tx).await
        }
        async fn save_transaction(&self, tx: &Transaction) -> Result<()> {
            self.inner.save_transaction(tx).await
        }
        async fn delete_transaction(&self, user: &str, id: &str) -> Result<()> {
            unavailable(&self.fail_transaction_deletes, "transaction")?;
            self.inner.delete_transaction(user, id).await
        }
    }

    #[tokio::test]
    async fn failed_write_removes_transaction_and_restores_state() {
        let store = Arc::new(FlakyStore::default());
        let (ledger, user) = setup(store.clone(), 100000.0).await;
        store.fail_security_saves.store(true, Ordering::SeqCst);

        let err = ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Processing(_)));

        assert!(ledger.transactions(&user.id).await.unwrap().is_empty());
        let profile = ledger.profile(&user.id, day(0)).await.unwrap();
        assert_eq!(profile.funds.usable, 100000.0);
        assert_eq!(holding(&ledger, &user.id).await.shares.total(), 0.0);
    }

    #[tokio::test]
    async fn failed_update_restores_prior_transaction() {
        let store = Arc::new(FlakyStore::default());
        let (ledger, user) = setup(store.clone(), 100000.0).await;
        let buy = ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        store.fail_user_saves.store(true, Ordering::SeqCst);

        let err = ledger
            .update_transaction(&user.id, &buy.id, TransactionType::Buy, 4.0, day(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Processing(_)));
        store.fail_user_saves.store(false, Ordering::SeqCst);

        let stored = ledger.load_transaction(&user.id, &buy.id).await.unwrap();
        assert_eq!(stored, buy);
        let profile = ledger.profile(&user.id, day(1)).await.unwrap();
        assert_eq!(profile.funds.usable, 90000.0);
        let h = holding(&ledger, &user.id).await;
        assert_eq!(h.shares.total(), 10.0);
        assert_eq!(h.average_price, 1000.0);
        assert_eq!(
            ledger.load_security("tcs").await.unwrap().shares_for_sale,
            9990.0
        );
    }

    #[tokio::test]
    async fn failed_record_delete_restores_balances() {
        let store = Arc::new(FlakyStore::default());
        let (ledger, user) = setup(store.clone(), 100000.0).await;
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 20.0, day(0))
            .await
            .unwrap();
        ledger.update_price("tcs", 1500.0).await.unwrap();
        let sell = ledger
            .place_order(&user.id, "tcs", TransactionType::Sell, 8.0, day(1))
            .await
            .unwrap();
        store.fail_transaction_deletes.store(true, Ordering::SeqCst);

        let err = ledger
            .delete_transaction(&user.id, &sell.id, day(2))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Processing(_)));
        store.fail_transaction_deletes.store(false, Ordering::SeqCst);

        assert_eq!(ledger.transactions(&user.id).await.unwrap().len(), 2);
        let profile = ledger.profile(&user.id, day(2)).await.unwrap();
        assert_eq!(profile.funds.total(), 92000.0);
        assert_eq!(profile.total_returns, 4000.0);
        let h = holding(&ledger, &user.id).await;
        assert_eq!(h.shares.total(), 12.0);
        assert_eq!(h.total_returns, 4000.0);
        assert_eq!(
            ledger.load_security("tcs").await.unwrap().shares_for_sale,
            9988.0
        );
    }

    #[tokio::test]
    async fn updating_an_early_sell_keeps_returns_in_step() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        ledger.update_price("tcs", 100.0).await.unwrap();
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        ledger.update_price("tcs", 200.0).await.unwrap();
        let sell = ledger
            .place_order(&user.id, "tcs", TransactionType::Sell, 5.0, day(1))
            .await
            .unwrap();
        ledger.update_price("tcs", 400.0).await.unwrap();
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(2))
            .await
            .unwrap();

        let updated = ledger
            .update_transaction(&user.id, &sell.id, TransactionType::Sell, 2.0, day(3))
            .await
            .unwrap();
        assert_eq!(updated.average_price, 100.0);

        let profile = ledger.profile(&user.id, day(3)).await.unwrap();
        let h = holding(&ledger, &user.id).await;
        assert!(close(profile.total_returns, 200.0));
        assert!(close(h.total_returns, profile.total_returns));
        assert!(close(h.average_price, 4800.0 / 18.0));
        assert_eq!(h.shares.total(), 18.0);
        assert_eq!(profile.funds.total(), 95400.0);

        let history = ledger.transactions(&user.id).await.unwrap();
        let replayed = calculate_holdings(&user.id, "tcs", &history, None, day(3)).unwrap();
        assert!(replayed.matches(&h));
    }

    #[tokio::test]
    async fn paid_out_shares_stay_closed_after_reconcile() {
        let (ledger, user) = setup(Arc::new(MemoryStore::new()), 100000.0).await;
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        ledger.update_price("tcs", 1200.0).await.unwrap();
        ledger.delete_security("tcs", day(0)).await.unwrap();

        let closing = ledger.transactions(&user.id).await.unwrap();
        assert_eq!(closing.len(), 2);
        assert_eq!(closing[1].kind, TransactionType::Sell);
        assert_eq!(closing[1].exchange_price, 1200.0);

        let h = ledger.reconcile_holding(&user.id, "tcs", day(1)).await.unwrap();
        assert_eq!(h.shares.total(), 0.0);
        assert_eq!(h.total_returns, 2000.0);

        ledger.create_security("tcs", 500.0, 500.0).await.unwrap();
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 2.0, day(1))
            .await
            .unwrap();
        let h = ledger.reconcile_holding(&user.id, "tcs", day(1)).await.unwrap();
        assert_eq!(h.shares.total(), 2.0);
        assert_eq!(h.average_price, 500.0);
        let profile = ledger.profile(&user.id, day(1)).await.unwrap();
        assert_eq!(profile.funds.usable, 101000.0);
    }

    #[tokio::test]
    async fn failed_payout_can_be_retried_once() {
        let store = Arc::new(FlakyStore::default());
        let (ledger, user) = setup(store.clone(), 100000.0).await;
        ledger
            .place_order(&user.id, "tcs", TransactionType::Buy, 10.0, day(0))
            .await
            .unwrap();
        store.fail_holding_saves.store(true, Ordering::SeqCst);

        let err = ledger.delete_security("tcs", day(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Processing(_)));
        assert_eq!(ledger.transactions(&user.id).await.unwrap().len(), 1);
        assert!(ledger.load_security("tcs").await.is_ok());

        store.fail_holding_saves.store(false, Ordering::SeqCst);
        ledger.delete_security("tcs", day(1)).await.unwrap();
        let profile = ledger.profile(&user.id, day(1)).await.unwrap();
        assert_eq!(profile.funds.usable, 100000.0);
        assert_eq!(profile.total_returns, 0.0);
        assert_eq!(holding(&ledger, &user.id).await.shares.total(), 0.0);
    }
}
