// src/api.rs
//! HTTP routes under the configured prefix.
//!
//! Everything except login and the health check needs a bearer token. There
//! is no admin role: any logged-in user may create, re-price or delete a
//! security.

use crate::auth::{create_token, verify_bearer};
use crate::config::Config;
use crate::error::{ApiError, LedgerError};
use crate::ledger::Ledger;
use crate::models::TransactionType;
use crate::validate;
use chrono::Utc;
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    mobile: String,
    user_name: Option<String>,
}

#[derive(Deserialize)]
struct TopUpRequest {
    funds: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSecurityRequest {
    ticker: String,
    total_shares: u32,
    current_price: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceRequest {
    current_price: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest {
    share_count: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTransactionRequest {
    share_count: u32,
    #[serde(rename = "type")]
    kind: TransactionType,
}

pub fn routes(
    ledger: Arc<Ledger>,
    config: Arc<Config>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let health = warp::path!("user" / "health-check")
        .and(warp::post())
        .map(|| warp::reply::json(&json!({"status": "server up and running"})));

    let login = warp::path!("user")
        .and(warp::post())
        .and(with_ledger(ledger.clone()))
        .and(with_config(config.clone()))
        .and(warp::body::json())
        .and_then(login_handler);

    let profile = warp::path!("user")
        .and(warp::get())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and_then(profile_handler);

    let top_up = warp::path!("user" / "topup")
        .and(warp::put())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(top_up_handler);

    let create_security = warp::path!("security")
        .and(warp::post())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(create_security_handler);

    let list_securities = warp::path!("security")
        .and(warp::get())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and_then(list_securities_handler);

    let update_price = warp::path!("security" / String / "price")
        .and(warp::put())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(update_price_handler);

    let delete_security = warp::path!("security" / String)
        .and(warp::delete())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and_then(delete_security_handler);

    let holdings = warp::path!("holding")
        .and(warp::get())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and_then(holdings_handler);

    let reconcile = warp::path!("holding" / String / "reconcile")
        .and(warp::post())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and_then(reconcile_handler);

    let transactions = warp::path!("transaction")
        .and(warp::get())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and_then(transactions_handler);

    let buy = warp::path!("transaction" / "buy" / String)
        .and(warp::post())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(|ticker: String, user: String, ledger: Arc<Ledger>, body: OrderRequest| {
            order_handler(ticker, user, ledger, body, TransactionType::Buy)
        });

    let sell = warp::path!("transaction" / "sell" / String)
        .and(warp::post())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(|ticker: String, user: String, ledger: Arc<Ledger>, body: OrderRequest| {
            order_handler(ticker, user, ledger, body, TransactionType::Sell)
        });

    let update_transaction = warp::path!("transaction" / String)
        .and(warp::put())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger.clone()))
        .and(warp::body::json())
        .and_then(update_transaction_handler);

    let delete_transaction = warp::path!("transaction" / String)
        .and(warp::delete())
        .and(with_user(config.clone()))
        .and(with_ledger(ledger))
        .and_then(delete_transaction_handler);

    let api = health
        .or(login)
        .or(profile)
        .or(top_up)
        .or(create_security)
        .or(list_securities)
        .or(update_price)
        .or(delete_security)
        .or(holdings)
        .or(reconcile)
        .or(transactions)
        .or(buy)
        .or(sell)
        .or(update_transaction)
        .or(delete_transaction);

    warp::path(config.api_prefix.clone())
        .and(api)
        .recover(handle_rejection)
        .with(warp::log("stock_ledger::api"))
}

fn with_ledger(
    ledger: Arc<Ledger>,
) -> impl Filter<Extract = (Arc<Ledger>,), Error = Infallible> + Clone {
    warp::any().map(move || ledger.clone())
}

fn with_config(
    config: Arc<Config>,
) -> impl Filter<Extract = (Arc<Config>,), Error = Infallible> + Clone {
    warp::any().map(move || config.clone())
}

/// Resolves the caller's user id from the bearer token.
fn with_user(config: Arc<Config>) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
        let config = config.clone();
        async move { verify_bearer(header, &config.app_secret).map_err(reject) }
    })
}

fn reject(e: LedgerError) -> Rejection {
    warp::reject::custom(ApiError::from(e))
}

fn failed(action: &str, e: LedgerError) -> Rejection {
    match e {
        LedgerError::Processing(_) | LedgerError::Storage(_) => {
            error!("Failed to {}: {}", action, e)
        }
        _ => info!("Refused to {}: {}", action, e),
    }
    reject(e)
}

async fn login_handler(
    ledger: Arc<Ledger>,
    config: Arc<Config>,
    body: LoginRequest,
) -> Result<impl Reply, Rejection> {
    validate::mobile(&body.mobile).map_err(reject)?;
    let now = Utc::now();
    let user = ledger
        .login(&body.mobile, body.user_name, now)
        .await
        .map_err(|e| failed("log in", e))?;
    let token = create_token(&user.id, &config.app_secret, config.jwt_expires_in, now)
        .map_err(|e| failed("issue token", e))?;
    info!("User {} logged in.", user.id);
    Ok(warp::reply::json(&json!({
        "message": "Logged in successfully",
        "token": token,
        "user": user,
    })))
}

async fn profile_handler(user_id: String, ledger: Arc<Ledger>) -> Result<impl Reply, Rejection> {
    match ledger.profile(&user_id, Utc::now()).await {
        Ok(user) => Ok(warp::reply::json(&json!({ "user": user }))),
        Err(e) => Err(failed("load profile", e)),
    }
}

async fn top_up_handler(
    user_id: String,
    ledger: Arc<Ledger>,
    body: TopUpRequest,
) -> Result<impl Reply, Rejection> {
    validate::int_range("funds", body.funds, 1, 100_000).map_err(reject)?;
    match ledger.top_up(&user_id, body.funds as f64, Utc::now()).await {
        Ok(user) => Ok(warp::reply::json(&json!({
            "message": "Funds added successfully",
            "user": user,
        }))),
        Err(e) => Err(failed("top up", e)),
    }
}

async fn create_security_handler(
    _user_id: String,
    ledger: Arc<Ledger>,
    body: CreateSecurityRequest,
) -> Result<impl Reply, Rejection> {
    validate::ticker(&body.ticker).map_err(reject)?;
    validate::int_range("totalShares", body.total_shares, 10, 100_000).map_err(reject)?;
    validate::int_range("currentPrice", body.current_price, 1, 100_000).map_err(reject)?;
    match ledger
        .create_security(
            &body.ticker,
            body.total_shares as f64,
            body.current_price as f64,
        )
        .await
    {
        Ok(security) => Ok(warp::reply::with_status(
            warp::reply::json(&json!({
                "message": "Security created successfully",
                "security": security,
            })),
            StatusCode::CREATED,
        )),
        Err(e) => Err(failed("create security", e)),
    }
}

async fn list_securities_handler(
    _user_id: String,
    ledger: Arc<Ledger>,
) -> Result<impl Reply, Rejection> {
    match ledger.securities().await {
        Ok(securities) => Ok(warp::reply::json(&json!({
            "message": "Security fetched Successfully",
            "securities": securities,
        }))),
        Err(e) => Err(failed("list securities", e)),
    }
}

async fn update_price_handler(
    ticker: String,
    _user_id: String,
    ledger: Arc<Ledger>,
    body: PriceRequest,
) -> Result<impl Reply, Rejection> {
    validate::ticker(&ticker).map_err(reject)?;
    validate::int_range("currentPrice", body.current_price, 1, 100_000).map_err(reject)?;
    match ledger.update_price(&ticker, body.current_price as f64).await {
        Ok(security) => Ok(warp::reply::json(&json!({
            "message": "Price updated successfully",
            "security": security,
        }))),
        Err(e) => Err(failed("update price", e)),
    }
}

async fn delete_security_handler(
    ticker: String,
    _user_id: String,
    ledger: Arc<Ledger>,
) -> Result<impl Reply, Rejection> {
    validate::ticker(&ticker).map_err(reject)?;
    match ledger.delete_security(&ticker, Utc::now()).await {
        Ok(security) => Ok(warp::reply::json(&json!({
            "message": "Security Deleted successfully",
            "security": security,
        }))),
        Err(e) => Err(failed("delete security", e)),
    }
}

async fn holdings_handler(user_id: String, ledger: Arc<Ledger>) -> Result<impl Reply, Rejection> {
    match ledger.holdings(&user_id, Utc::now()).await {
        Ok(holdings) => Ok(warp::reply::json(&json!({
            "message": "Holding fetched Successfully",
            "holdings": holdings,
        }))),
        Err(e) => Err(failed("list holdings", e)),
    }
}

async fn reconcile_handler(
    ticker: String,
    user_id: String,
    ledger: Arc<Ledger>,
) -> Result<impl Reply, Rejection> {
    validate::ticker(&ticker).map_err(reject)?;
    match ledger.reconcile_holding(&user_id, &ticker, Utc::now()).await {
        Ok(holding) => Ok(warp::reply::json(&json!({
            "message": "Holding reconciled",
            "holding": holding,
        }))),
        Err(e) => Err(failed("reconcile holding", e)),
    }
}

async fn transactions_handler(
    user_id: String,
    ledger: Arc<Ledger>,
) -> Result<impl Reply, Rejection> {
    match ledger.transactions(&user_id).await {
        Ok(transactions) => Ok(warp::reply::json(&json!({
            "message": "Transactions fetched Successfully",
            "transactions": transactions,
        }))),
        Err(e) => Err(failed("list transactions", e)),
    }
}

async fn order_handler(
    ticker: String,
    user_id: String,
    ledger: Arc<Ledger>,
    body: OrderRequest,
    kind: TransactionType,
) -> Result<impl Reply, Rejection> {
    validate::ticker(&ticker).map_err(reject)?;
    validate::share_count(body.share_count).map_err(reject)?;
    match ledger
        .place_order(&user_id, &ticker, kind, body.share_count as f64, Utc::now())
        .await
    {
        Ok(transaction) => {
            let message = match kind {
                TransactionType::Buy => "Shares purchased successfully",
                TransactionType::Sell => "Shares sold successfully",
            };
            Ok(warp::reply::json(&json!({
                "message": message,
                "transaction": transaction,
            })))
        }
        Err(e) => Err(failed("place order", e)),
    }
}

async fn update_transaction_handler(
    id: String,
    user_id: String,
    ledger: Arc<Ledger>,
    body: UpdateTransactionRequest,
) -> Result<impl Reply, Rejection> {
    validate::share_count(body.share_count).map_err(reject)?;
    match ledger
        .update_transaction(
            &user_id,
            &id,
            body.kind,
            body.share_count as f64,
            Utc::now(),
        )
        .await
    {
        Ok(transaction) => Ok(warp::reply::json(&json!({
            "message": "Transaction updated successfully",
            "transaction": transaction,
        }))),
        Err(e) => Err(failed("update transaction", e)),
    }
}

async fn delete_transaction_handler(
    id: String,
    user_id: String,
    ledger: Arc<Ledger>,
) -> Result<impl Reply, Rejection> {
    match ledger.delete_transaction(&user_id, &id, Utc::now()).await {
        Ok(transaction) => Ok(warp::reply::json(&json!({
            "message": "Transaction deleted successfully",
            "transaction": transaction,
        }))),
        Err(e) => Err(failed("delete transaction", e)),
    }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(e) = err.find::<ApiError>() {
        (e.status, e.message.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed".to_string(),
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        status,
    ))
}
