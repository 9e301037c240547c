// src/memory.rs
use crate::db::Store;
use crate::error::{LedgerError, Result};
use crate::models::{Holding, Security, Transaction, User};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    securities: HashMap<String, Security>,
    holdings: HashMap<(String, String), Holding>,
    /// Kept in insertion order; `list_transactions` sorts stably by creation time.
    transactions: Vec<Transaction>,
}

/// Process-local `Store`. Backs the `memory` storage mode and the tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| LedgerError::Storage("memory store poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| LedgerError::Storage("memory store poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.read()?.users.get(id).cloned())
    }

    async fn find_user_by_mobile(&self, mobile: &str) -> Result<Option<User>> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.mobile == mobile)
            .cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        self.write()?.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        self.insert_user(user).await
    }

    async fn get_security(&self, ticker: &str) -> Result<Option<Security>> {
        Ok(self.read()?.securities.get(ticker).cloned())
    }

    async fn list_securities(&self, limit: usize) -> Result<Vec<Security>> {
        let mut securities: Vec<Security> = self.read()?.securities.values().cloned().collect();
        securities.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        securities.truncate(limit);
        Ok(securities)
    }

    async fn insert_security(&self, security: &Security) -> Result<()> {
        let mut tables = self.write()?;
        if tables.securities.contains_key(&security.ticker) {
            return Err(LedgerError::DuplicateTicker(security.ticker.clone()));
        }
        tables
            .securities
            .insert(security.ticker.clone(), security.clone());
        Ok(())
    }

    async fn save_security(&self, security: &Security) -> Result<()> {
        self.write()?
            .securities
            .insert(security.ticker.clone(), security.clone());
        Ok(())
    }

    async fn delete_security(&self, ticker: &str) -> Result<()> {
        self.write()?.securities.remove(ticker);
        Ok(())
    }

    async fn get_holding(&self, user: &str, ticker: &str) -> Result<Option<Holding>> {
        Ok(self
            .read()?
            .holdings
            .get(&(user.to_string(), ticker.to_string()))
            .cloned())
    }

    async fn list_holdings_by_user(&self, user: &str) -> Result<Vec<Holding>> {
        let mut holdings: Vec<Holding> = self
            .read()?
            .holdings
            .values()
            .filter(|h| h.user == user)
            .cloned()
            .collect();
        holdings.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(holdings)
    }

    async fn list_holdings_by_ticker(&self, ticker: &str) -> Result<Vec<Holding>> {
        let mut holdings: Vec<Holding> = self
            .read()?
            .holdings
            .values()
            .filter(|h| h.ticker == ticker)
            .cloned()
            .collect();
        holdings.sort_by(|a, b| a.user.cmp(&b.user));
        Ok(holdings)
    }

    async fn save_holding(&self, holding: &Holding) -> Result<()> {
        self.write()?.holdings.insert(
            (holding.user.clone(), holding.ticker.clone()),
            holding.clone(),
        );
        Ok(())
    }

    async fn get_transaction(&self, user: &str, id: &str) -> Result<Option<Transaction>> {
        Ok(self
            .read()?
            .transactions
            .iter()
            .find(|t| t.id == id && t.user == user)
            .cloned())
    }

    async fn list_transactions(&self, user: &str) -> Result<Vec<Transaction>> {
        let mut transactions: Vec<Transaction> = self
            .read()?
            .transactions
            .iter()
            .filter(|t| t.user == user)
            .cloned()
            .collect();
        transactions.sort_by_key(|t| t.created_at);
        Ok(transactions)
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        self.write()?.transactions.push(tx.clone());
        Ok(())
    }

    async fn save_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut tables = self.write()?;
        match tables.transactions.iter_mut().find(|t| t.id == tx.id) {
            Some(existing) => *existing = tx.clone(),
            None => tables.transactions.push(tx.clone()),
        }
        Ok(())
    }

    async fn delete_transaction(&self, user: &str, id: &str) -> Result<()> {
        let mut tables = self.write()?;
        let before = tables.transactions.len();
        tables.transactions.retain(|t| !(t.id == id && t.user == user));
        if tables.transactions.len() == before {
            return Err(LedgerError::UnknownTransaction(id.to_string()));
        }
        Ok(())
    }
}
