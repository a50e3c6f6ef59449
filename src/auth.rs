//! Bearer-token authentication and the username directory client.
//!
//! The signed token carries the external user id; the directory API
//! resolves it to a username, and the users table supplies the
//! chat-internal id and feature labels.

use crate::db::{Database, DbError};
use crate::user::{features_from_labels, FeatureMemo, User};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token invalid")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("user has not set a username")]
    NoUsername,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Claims carried by the signed bearer token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// External user id.
    pub id: String,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Verify an HS256 token and return its claims.
pub fn parse_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

/// Mint a short-lived token for this process's own upstream API calls.
pub fn mint_api_token(secret: &str, user_id: &str) -> Result<String, AuthError> {
    let claims = Claims {
        id: user_id.to_string(),
        exp: Utc::now().timestamp() + 3600,
    };
    Ok(jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Username directory HTTP client.
#[derive(Clone)]
pub struct Directory {
    client: reqwest::Client,
    base_url: String,
}

impl Directory {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    /// Resolve an external user id to its username.
    pub async fn username(&self, uuid: &str) -> Result<String, AuthError> {
        #[derive(Deserialize)]
        struct UsernameResponse {
            #[serde(default)]
            username: String,
        }

        let response: UsernameResponse = self
            .client
            .get(format!("{}{}", self.base_url, uuid))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.username.is_empty() {
            return Err(AuthError::NoUsername);
        }
        Ok(response.username)
    }
}

/// Resolve a token into a chat user: verify the signature, look up the
/// username, upsert the user row and load its features.
pub async fn resolve_user(
    db: &Database,
    directory: &Directory,
    memo: &FeatureMemo,
    secret: &str,
    token: &str,
    ip: &str,
) -> Result<User, AuthError> {
    let claims = parse_token(secret, token)?;
    let username = directory.username(&claims.id).await?;

    db.new_user(&claims.id, &username, ip).await?;
    let (id, features) = db.get_user_info(&claims.id).await?;
    db.update_user(id, &username, ip).await?;

    Ok(User::new(id, username, features_from_labels(&features), memo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let token = mint_api_token("secret", "uuid-42").expect("mint");
        let claims = parse_token("secret", &token).expect("verify");
        assert_eq!(claims.id, "uuid-42");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = mint_api_token("secret", "uuid-42").expect("mint");
        assert!(matches!(
            parse_token("other", &token),
            Err(AuthError::Token(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let claims = Claims {
            id: "uuid-42".into(),
            exp: Utc::now().timestamp() - 600,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .expect("encode");
        assert!(matches!(
            parse_token("secret", &token),
            Err(AuthError::Token(_))
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(matches!(
            parse_token("secret", "not.a.token"),
            Err(AuthError::Token(_))
        ));
    }
}
