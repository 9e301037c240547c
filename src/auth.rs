// src/auth.rs
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
struct Claims {
    sub: String,
    exp: usize,
}

// Function to create a JWT token for an authenticated user
pub fn create_token(
    user_id: &str,
    secret: &str,
    expires_in_days: i64,
    now: DateTime<Utc>,
) -> Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (now + Duration::days(expires_in_days)).timestamp() as usize,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
    .map_err(|e| LedgerError::Processing(format!("failed to sign token: {}", e)))
}

/// Returns the user id carried by a `Bearer` authorization header.
pub fn verify_bearer(header: Option<String>, secret: &str) -> Result<String> {
    let header = header
        .ok_or_else(|| LedgerError::Unauthorized("No authorization token was found".into()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| LedgerError::Unauthorized("Format is Authorization: Bearer [token]".into()))?;
    let data = decode::<Claims>(
        token.trim(),
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| LedgerError::Unauthorized(format!("Invalid Token! {}", e)))?;
    Ok(data.claims.sub)
}
