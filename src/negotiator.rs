//! Registration and token acquisition in front of secured operations.
//!
//! [`Negotiator::ensure_authenticated`] is idempotent: it registers only when
//! no client secret is stored and requests a token only when no (unexpired)
//! token is stored. Each successful step is persisted by the credential store
//! before the next one starts. The caller holds the store's lock for the whole
//! sequence, which keeps a single writer even when several subscriptions
//! share the store.

use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialState, CredentialStore};
use crate::error::{Result, SepaError};

#[derive(Debug, Deserialize)]
struct Registration {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    access_token: String,
    expires_in: Option<i64>,
}

/// Host name of this machine, the identity sent when registering.
pub fn machine_identity() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "sepa-client".to_string())
}

#[derive(Debug, Clone)]
pub struct Negotiator {
    http: reqwest::Client,
    register_uri: String,
    token_uri: String,
    identity: String,
}

impl Negotiator {
    pub fn new(
        http: reqwest::Client,
        register_uri: impl Into<String>,
        token_uri: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            http,
            register_uri: register_uri.into(),
            token_uri: token_uri.into(),
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Registers this client; a 201 answer carries the id and secret.
    pub async fn register(&self, store: &mut CredentialStore) -> Result<()> {
        debug!(uri = %self.register_uri, identity = %self.identity, "registering");
        let payload = json!({
            "client_identity": self.identity,
            "grant_types": ["client_credentials"],
        });
        let response = self
            .http
            .post(&self.register_uri)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::CREATED {
            warn!(status = status.as_u16(), "registration refused");
            return Err(SepaError::RegistrationFailed { status: status.as_u16(), body });
        }
        let registration: Registration = serde_json::from_str(&body)
            .map_err(|e| SepaError::RegistrationFailed { status: status.as_u16(), body: e.to_string() })?;
        store.set_registration(&self.identity, &registration.client_id, &registration.client_secret)?;
        info!(client_id = %registration.client_id, "registered");
        Ok(())
    }

    /// Exchanges the stored Basic authorization for a bearer token.
    pub async fn request_token(&self, store: &mut CredentialStore) -> Result<()> {
        let Some(authorization) = store.authorization().map(str::to_string) else {
            return Err(SepaError::TokenRequestFailed {
                status: StatusCode::UNAUTHORIZED.as_u16(),
                body: "client is not registered".into(),
            });
        };
        debug!(uri = %self.token_uri, "requesting token");
        let response = self
            .http
            .post(&self.token_uri)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, authorization)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::CREATED {
            warn!(status = status.as_u16(), "token request refused");
            return Err(SepaError::TokenRequestFailed { status: status.as_u16(), body });
        }
        let granted: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| SepaError::TokenRequestFailed { status: status.as_u16(), body: e.to_string() })?;
        store.set_token(granted.token.access_token, granted.token.expires_in, Utc::now())?;
        info!(expires = ?store.state().expires, "token acquired");
        Ok(())
    }

    pub async fn ensure_authenticated(&self, store: &mut CredentialStore) -> Result<CredentialState> {
        if store.state().has_token() && store.state().token_expired(Utc::now()) {
            debug!("stored token is past its expiry");
            store.clear_token()?;
        }
        if !store.state().is_registered() {
            self.register(store).await?;
        }
        if !store.state().has_token() {
            self.request_token(store).await?;
        }
        Ok(store.state().clone())
    }
}

/// A 401 on a secured call drops the token that was `sent`, the caller retries
/// to get a new one. A token stored since then by another call is kept.
pub fn check_authorized(status: StatusCode, sent: &str, store: &mut CredentialStore) -> Result<()> {
    if status == StatusCode::UNAUTHORIZED {
        if store.jwt() == Some(sent) {
            warn!("secured request rejected, dropping token");
            store.clear_token()?;
        } else {
            debug!("secured request rejected, token already replaced");
        }
        return Err(SepaError::TokenExpired);
    }
    Ok(())
}
