// src/db.rs
use crate::error::{LedgerError, Result};
use crate::models::{Holding, LockedBalance, Security, Transaction, TransactionType, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use scylla::frame::response::result::{CqlValue, Row};
use scylla::{query::Query, Session, SessionBuilder};

/// Keyed record stores for the four ledger entities.
///
/// Entities are always written whole; `list_transactions` returns a user's
/// history in ascending creation order.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<User>>;
    async fn find_user_by_mobile(&self, mobile: &str) -> Result<Option<User>>;
    async fn insert_user(&self, user: &User) -> Result<()>;
    async fn save_user(&self, user: &User) -> Result<()>;

    async fn get_security(&self, ticker: &str) -> Result<Option<Security>>;
    async fn list_securities(&self, limit: usize) -> Result<Vec<Security>>;
    async fn insert_security(&self, security: &Security) -> Result<()>;
    async fn save_security(&self, security: &Security) -> Result<()>;
    async fn delete_security(&self, ticker: &str) -> Result<()>;

    async fn get_holding(&self, user: &str, ticker: &str) -> Result<Option<Holding>>;
    async fn list_holdings_by_user(&self, user: &str) -> Result<Vec<Holding>>;
    async fn list_holdings_by_ticker(&self, ticker: &str) -> Result<Vec<Holding>>;
    async fn save_holding(&self, holding: &Holding) -> Result<()>;

    async fn get_transaction(&self, user: &str, id: &str) -> Result<Option<Transaction>>;
    async fn list_transactions(&self, user: &str) -> Result<Vec<Transaction>>;
    async fn insert_transaction(&self, tx: &Transaction) -> Result<()>;
    async fn save_transaction(&self, tx: &Transaction) -> Result<()>;
    async fn delete_transaction(&self, user: &str, id: &str) -> Result<()>;
}

pub struct ScyllaStore {
    session: Session,
}

const SCHEMA: &[&str] = &[
    "CREATE KEYSPACE IF NOT EXISTS stock_ledger WITH REPLICATION = {'class': 'SimpleStrategy', 'replication_factor': 1}",
    "CREATE TABLE IF NOT EXISTS stock_ledger.users (id TEXT PRIMARY KEY, mobile TEXT, user_name TEXT, funds DOUBLE, locked_funds DOUBLE, locked_till BIGINT, total_returns DOUBLE, last_seen BIGINT)",
    "CREATE TABLE IF NOT EXISTS stock_ledger.users_by_mobile (mobile TEXT PRIMARY KEY, id TEXT)",
    "CREATE TABLE IF NOT EXISTS stock_ledger.securities (ticker TEXT PRIMARY KEY, total_shares DOUBLE, shares_for_sale DOUBLE, current_price DOUBLE)",
    "CREATE TABLE IF NOT EXISTS stock_ledger.holdings (user_id TEXT, ticker TEXT, share_count DOUBLE, locked_shares DOUBLE, locked_till BIGINT, average_price DOUBLE, total_returns DOUBLE, PRIMARY KEY (user_id, ticker))",
    "CREATE INDEX IF NOT EXISTS ON stock_ledger.holdings (ticker)",
    "CREATE TABLE IF NOT EXISTS stock_ledger.transactions (user_id TEXT, created_at BIGINT, id TEXT, ticker TEXT, kind TEXT, share_count DOUBLE, exchange_price DOUBLE, average_price DOUBLE, unlocked_till BIGINT, PRIMARY KEY (user_id, created_at, id)) WITH CLUSTERING ORDER BY (created_at ASC, id ASC)",
    "CREATE INDEX IF NOT EXISTS ON stock_ledger.transactions (id)",
];

const USER_COLUMNS: &str =
    "id, mobile, user_name, funds, locked_funds, locked_till, total_returns, last_seen";
const HOLDING_COLUMNS: &str =
    "user_id, ticker, share_count, locked_shares, locked_till, average_price, total_returns";
const TX_COLUMNS: &str =
    "user_id, created_at, id, ticker, kind, share_count, exchange_price, average_price, unlocked_till";

impl ScyllaStore {
    pub async fn init(node: &str) -> Result<Self> {
        let session = SessionBuilder::new().known_node(node).build().await?;

        // Create keyspace and tables if they don't exist
        for statement in SCHEMA {
            session.query(*statement, &[]).await?;
        }

        info!("Successfully connected to ScyllaDB at {}.", node);
        Ok(Self { session })
    }
}

fn rows(rows: Option<Vec<Row>>) -> Vec<Row> {
    rows.unwrap_or_default()
}

fn column<'a>(row: &'a Row, i: usize) -> Result<&'a CqlValue> {
    row.columns
        .get(i)
        .and_then(|c| c.as_ref())
        .ok_or_else(|| LedgerError::Storage(format!("missing column {}", i)))
}

fn text(row: &Row, i: usize) -> Result<String> {
    column(row, i)?
        .as_text()
        .cloned()
        .ok_or_else(|| LedgerError::Storage(format!("column {} is not text", i)))
}

fn double(row: &Row, i: usize) -> Result<f64> {
    column(row, i)?
        .as_double()
        .ok_or_else(|| LedgerError::Storage(format!("column {} is not a double", i)))
}

fn millis(row: &Row, i: usize) -> Result<i64> {
    column(row, i)?
        .as_bigint()
        .ok_or_else(|| LedgerError::Storage(format!("column {} is not a bigint", i)))
}

fn time(row: &Row, i: usize) -> Result<DateTime<Utc>> {
    let ms = millis(row, i)?;
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| LedgerError::Storage(format!("timestamp {} out of range", ms)))
}

/// Lock windows are stored as millis with 0 meaning "none".
fn optional_time(row: &Row, i: usize) -> Result<Option<DateTime<Utc>>> {
    match millis(row, i)? {
        0 => Ok(None),
        ms => Ok(DateTime::<Utc>::from_timestamp_millis(ms)),
    }
}

fn to_millis(t: Option<DateTime<Utc>>) -> i64 {
    t.map(|t| t.timestamp_millis()).unwrap_or(0)
}

fn user_from_row(row: &Row) -> Result<User> {
    let user_name = text(row, 2)?;
    Ok(User {
        id: text(row, 0)?,
        mobile: text(row, 1)?,
        user_name: if user_name.is_empty() {
            None
        } else {
            Some(user_name)
        },
        funds: LockedBalance {
            usable: double(row, 3)?,
            pending: double(row, 4)?,
            pending_until: optional_time(row, 5)?,
        },
        total_returns: double(row, 6)?,
        last_seen: time(row, 7)?,
    })
}

fn security_from_row(row: &Row) -> Result<Security> {
    Ok(Security {
        ticker: text(row, 0)?,
        total_shares: double(row, 1)?,
        shares_for_sale: double(row, 2)?,
        current_price: double(row, 3)?,
    })
}

fn holding_from_row(row: &Row) -> Result<Holding> {
    Ok(Holding {
        user: text(row, 0)?,
        ticker: text(row, 1)?,
        shares: LockedBalance {
            usable: double(row, 2)?,
            pending: double(row, 3)?,
            pending_until: optional_time(row, 4)?,
        },
        average_price: double(row, 5)?,
        total_returns: double(row, 6)?,
    })
}

fn transaction_from_row(row: &Row) -> Result<Transaction> {
    let kind: TransactionType = text(row, 4)?.parse().map_err(LedgerError::Storage)?;
    Ok(Transaction {
        user: text(row, 0)?,
        created_at: time(row, 1)?,
        id: text(row, 2)?,
        ticker: text(row, 3)?,
        kind,
        share_count: double(row, 5)?,
        exchange_price: double(row, 6)?,
        average_price: double(row, 7)?,
        unlocked_till: time(row, 8)?,
    })
}

/// Decodes every row or fails on the first malformed one.
fn parse_strict<T>(rows: Vec<Row>, parse: fn(&Row) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(parse).collect()
}

/// Decodes rows for read-only listings, logging and dropping malformed ones.
fn parse_all<T>(rows: Vec<Row>, parse: fn(&Row) -> Result<T>) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match parse(row) {
            Ok(v) => Some(v),
            Err(e) => {
                error!("Skipping malformed row: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl Store for ScyllaStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let query = Query::new(format!(
            "SELECT {} FROM stock_ledger.users WHERE id = ?",
            USER_COLUMNS
        ));
        let result = self.session.query(query, (id,)).await?;
        rows(result.rows).first().map(user_from_row).transpose()
    }

    async fn find_user_by_mobile(&self, mobile: &str) -> Result<Option<User>> {
        let query = Query::new("SELECT id FROM stock_ledger.users_by_mobile WHERE mobile = ?");
        let result = self.session.query(query, (mobile,)).await?;
        match rows(result.rows).first() {
            Some(row) => self.get_user(&text(row, 0)?).await,
            None => Ok(None),
        }
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        let query = Query::new(
            "INSERT INTO stock_ledger.users_by_mobile (mobile, id) VALUES (?, ?) IF NOT EXISTS",
        );
        self.session
            .query(query, (user.mobile.as_str(), user.id.as_str()))
            .await?;
        self.save_user(user).await
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        let query = Query::new(format!(
            "INSERT INTO stock_ledger.users ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            USER_COLUMNS
        ));
        self.session
            .query(
                query,
                (
                    user.id.as_str(),
                    user.mobile.as_str(),
                    user.user_name.clone().unwrap_or_default(),
                    user.funds.usable,
                    user.funds.pending,
                    to_millis(user.funds.pending_until),
                    user.total_returns,
                    user.last_seen.timestamp_millis(),
                ),
            )
            .await?;
        Ok(())
    }

    async fn get_security(&self, ticker: &str) -> Result<Option<Security>> {
        let query = Query::new("SELECT ticker, total_shares, shares_for_sale, current_price FROM stock_ledger.securities WHERE ticker = ?");
        let result = self.session.query(query, (ticker,)).await?;
        rows(result.rows).first().map(security_from_row).transpose()
    }

    async fn list_securities(&self, limit: usize) -> Result<Vec<Security>> {
        let query = Query::new("SELECT ticker, total_shares, shares_for_sale, current_price FROM stock_ledger.securities LIMIT ?");
        let result = self.session.query(query, (limit as i32,)).await?;
        let securities = parse_all(rows(result.rows), security_from_row);
        info!("Fetched {} securities", securities.len());
        Ok(securities)
    }

    async fn insert_security(&self, security: &Security) -> Result<()> {
        if self.get_security(&security.ticker).await?.is_some() {
            return Err(LedgerError::DuplicateTicker(security.ticker.clone()));
        }
        self.save_security(security).await
    }

    async fn save_security(&self, security: &Security) -> Result<()> {
        let query = Query::new("INSERT INTO stock_ledger.securities (ticker, total_shares, shares_for_sale, current_price) VALUES (?, ?, ?, ?)");
        self.session
            .query(
                query,
                (
                    security.ticker.as_str(),
                    security.total_shares,
                    security.shares_for_sale,
                    security.current_price,
                ),
            )
            .await?;
        Ok(())
    }

    async fn delete_security(&self, ticker: &str) -> Result<()> {
        let query = Query::new("DELETE FROM stock_ledger.securities WHERE ticker = ?");
        self.session.query(query, (ticker,)).await?;
        Ok(())
    }

    async fn get_holding(&self, user: &str, ticker: &str) -> Result<Option<Holding>> {
        let query = Query::new(format!(
            "SELECT {} FROM stock_ledger.holdings WHERE user_id = ? AND ticker = ?",
            HOLDING_COLUMNS
        ));
        let result = self.session.query(query, (user, ticker)).await?;
        rows(result.rows).first().map(holding_from_row).transpose()
    }

    async fn list_holdings_by_user(&self, user: &str) -> Result<Vec<Holding>> {
        let query = Query::new(format!(
            "SELECT {} FROM stock_ledger.holdings WHERE user_id = ?",
            HOLDING_COLUMNS
        ));
        let result = self.session.query(query, (user,)).await?;
        Ok(parse_all(rows(result.rows), holding_from_row))
    }

    async fn list_holdings_by_ticker(&self, ticker: &str) -> Result<Vec<Holding>> {
        let query = Query::new(format!(
            "SELECT {} FROM stock_ledger.holdings WHERE ticker = ?",
            HOLDING_COLUMNS
        ));
        let result = self.session.query(query, (ticker,)).await?;
        parse_strict(rows(result.rows), holding_from_row)
    }

    async fn save_holding(&self, holding: &Holding) -> Result<()> {
        let query = Query::new(format!(
            "INSERT INTO stock_ledger.holdings ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
            HOLDING_COLUMNS
        ));
        self.session
            .query(
                query,
                (
                    holding.user.as_str(),
                    holding.ticker.as_str(),
                    holding.shares.usable,
                    holding.shares.pending,
                    to_millis(holding.shares.pending_until),
                    holding.average_price,
                    holding.total_returns,
                ),
            )
            .await?;
        Ok(())
    }

    async fn get_transaction(&self, user: &str, id: &str) -> Result<Option<Transaction>> {
        let query = Query::new(format!(
            "SELECT {} FROM stock_ledger.transactions WHERE id = ?",
            TX_COLUMNS
        ));
        let result = self.session.query(query, (id,)).await?;
        let found = rows(result.rows)
            .first()
            .map(transaction_from_row)
            .transpose()?;
        Ok(found.filter(|tx| tx.user == user))
    }

    async fn list_transactions(&self, user: &str) -> Result<Vec<Transaction>> {
        let query = Query::new(format!(
            "SELECT {} FROM stock_ledger.transactions WHERE user_id = ? ORDER BY created_at ASC",
            TX_COLUMNS
        ));
        let result = self.session.query(query, (user,)).await?;
        let transactions = parse_strict(rows(result.rows), transaction_from_row)?;
        info!("Fetched {} transactions for user: {}", transactions.len(), user);
        Ok(transactions)
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        self.save_transaction(tx).await
    }

    async fn save_transaction(&self, tx: &Transaction) -> Result<()> {
        let query = Query::new(format!(
            "INSERT INTO stock_ledger.transactions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TX_COLUMNS
        ));
        self.session
            .query(
                query,
                (
                    tx.user.as_str(),
                    tx.created_at.timestamp_millis(),
                    tx.id.as_str(),
                    tx.ticker.as_str(),
                    tx.kind.to_string(),
                    tx.share_count,
                    tx.exchange_price,
                    tx.average_price,
                    tx.unlocked_till.timestamp_millis(),
                ),
            )
            .await?;
        Ok(())
    }

    async fn delete_transaction(&self, user: &str, id: &str) -> Result<()> {
        let tx = match self.get_transaction(user, id).await? {
            Some(tx) => tx,
            None => return Err(LedgerError::UnknownTransaction(id.to_string())),
        };
        let query = Query::new(
            "DELETE FROM stock_ledger.transactions WHERE user_id = ? AND created_at = ? AND id = ?",
        );
        self.session
            .query(query, (user, tx.created_at.timestamp_millis(), id))
            .await?;
        Ok(())
    }
}
