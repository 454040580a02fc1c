use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::binding::Bindings;
use crate::configuration::Configuration;
use crate::credentials::{CredentialStorage, CredentialStore, YamlFileStorage};
use crate::error::{Result, SepaError};
use crate::negotiator::{self, Negotiator};
use crate::settings::ClientSettings;
use crate::subscription::{NotificationHandler, SubscriptionManager};

const SPARQL_QUERY: &str = "application/sparql-query";
const SPARQL_UPDATE: &str = "application/sparql-update";

/// Outcome of a query or update. On success the payload is the broker's JSON
/// answer, otherwise the raw body (as a JSON string) or the broker's error message.
#[derive(Debug, Clone, PartialEq)]
pub struct SparqlResponse {
    pub success: bool,
    pub payload: Value,
}

impl SparqlResponse {
    fn failure(body: String) -> Self {
        Self { success: false, payload: Value::String(body) }
    }

    fn from_query(status: StatusCode, body: String) -> Result<Self> {
        if status != StatusCode::OK {
            return Ok(Self::failure(body));
        }
        let results: Value = serde_json::from_str(&body)?;
        match results.get("error") {
            Some(error) => {
                let message = error.get("message").cloned().unwrap_or_else(|| error.clone());
                Ok(Self { success: false, payload: message })
            }
            None => Ok(Self { success: true, payload: results }),
        }
    }

    fn from_update(status: StatusCode, body: String) -> Self {
        if status != StatusCode::OK {
            return Self::failure(body);
        }
        let payload = serde_json::from_str(&body).unwrap_or(Value::String(body));
        Self { success: true, payload }
    }
}

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub alias: Option<String>,
    pub secure: bool,
    pub handler: Option<Arc<dyn NotificationHandler>>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }
    pub fn handler(mut self, handler: impl NotificationHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }
}

/// Everything a program needs to talk to one broker: templated queries and
/// updates over HTTP(S) and live subscriptions over WebSocket(S).
pub struct SepaClient {
    configuration: Arc<Configuration>,
    settings: ClientSettings,
    http: reqwest::Client,
    credentials: Arc<Mutex<CredentialStore>>,
    subscriptions: SubscriptionManager,
    span: Span,
}

impl SepaClient {
    pub fn new(configuration: Arc<Configuration>, settings: ClientSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;
        let store = match &settings.credentials_path {
            Some(path) => CredentialStore::open(Box::new(YamlFileStorage::new(path)))?,
            None => CredentialStore::in_memory(),
        };
        let span = info_span!("sepa", host = %configuration.host);
        Ok(Self {
            subscriptions: SubscriptionManager::new(settings.subscribe_timeout()),
            configuration,
            settings,
            http,
            credentials: Arc::new(Mutex::new(store)),
            span,
        })
    }

    /// Replaces the credential backend, loading whatever it holds.
    pub fn with_credentials(mut self, storage: impl CredentialStorage + 'static) -> Result<Self> {
        self.credentials = Arc::new(Mutex::new(CredentialStore::open(Box::new(storage))?));
        Ok(self)
    }

    /// Everything this client logs is recorded inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }
    pub fn credentials(&self) -> Arc<Mutex<CredentialStore>> {
        Arc::clone(&self.credentials)
    }

    pub async fn query(&self, name: &str, bindings: &Bindings, secure: bool) -> Result<SparqlResponse> {
        async {
            let sparql = self.configuration.query_text(name, bindings, self.settings.substitution)?;
            let uri = self.endpoint(secure, &self.configuration.query_uri, &self.configuration.secure_query_uri)?;
            debug!(query = name, %uri, secure, "querying");
            let (status, body) = self.post(uri, SPARQL_QUERY, sparql, secure).await?;
            SparqlResponse::from_query(status, body)
        }
        .instrument(self.span.clone())
        .await
    }

    pub async fn update(&self, name: &str, bindings: &Bindings, secure: bool) -> Result<SparqlResponse> {
        async {
            let sparql = self.configuration.update_text(name, bindings, self.settings.substitution)?;
            let uri = self.endpoint(secure, &self.configuration.update_uri, &self.configuration.secure_update_uri)?;
            debug!(update = name, %uri, secure, "updating");
            let (status, body) = self.post(uri, SPARQL_UPDATE, sparql, secure).await?;
            Ok(SparqlResponse::from_update(status, body))
        }
        .instrument(self.span.clone())
        .await
    }

    /// Subscribes to a named query; returns once the broker has confirmed it.
    pub async fn subscribe(&self, name: &str, bindings: &Bindings, options: SubscribeOptions) -> Result<String> {
        async {
            let sparql = self.configuration.query_text(name, bindings, self.settings.substitution)?;
            let uri = self.endpoint(
                options.secure,
                &self.configuration.subscribe_uri,
                &self.configuration.secure_subscribe_uri,
            )?;
            let authorization = match options.secure {
                true => Some(self.bearer().await?),
                false => None,
            };
            debug!(query = name, %uri, secure = options.secure, "subscribing");
            self.subscriptions
                .subscribe(uri, &sparql, options.alias.as_deref(), authorization.as_deref(), options.handler)
                .await
        }
        .instrument(self.span.clone())
        .await
    }

    pub async fn unsubscribe(&self, spuid: &str) -> Result<()> {
        self.subscriptions.unsubscribe(spuid).instrument(self.span.clone()).await
    }

    /// Drops every live channel without asking the broker.
    pub fn close_all(&self) {
        let _entered = self.span.enter();
        self.subscriptions.close_all();
    }

    // ------------- Internals -------------
    fn endpoint<'a>(&self, secure: bool, plain: &'a str, secured: &'a Option<String>) -> Result<&'a str> {
        match (secure, secured) {
            (false, _) => Ok(plain),
            (true, Some(uri)) => Ok(uri),
            (true, None) => Err(SepaError::ConfigParsing("no security section in the configuration".into())),
        }
    }

    fn negotiator(&self) -> Result<Negotiator> {
        let (register, token) = self.configuration.security_uris()?;
        let identity = self.settings.client_identity.clone().unwrap_or_else(negotiator::machine_identity);
        Ok(Negotiator::new(self.http.clone(), register, token, identity))
    }

    /// A usable bearer token, registering and requesting one first if needed.
    async fn bearer(&self) -> Result<String> {
        let negotiator = self.negotiator()?;
        let mut store = self.credentials.lock().await;
        let state = negotiator.ensure_authenticated(&mut store).await?;
        state.jwt.ok_or(SepaError::TokenExpired)
    }

    async fn post(&self, uri: &str, content_type: &str, sparql: String, secure: bool) -> Result<(StatusCode, String)> {
        let mut request = self
            .http
            .post(uri)
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, "application/json")
            .body(sparql);
        let token = match secure {
            true => Some(self.bearer().await?),
            false => None,
        };
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if let Some(token) = &token {
            let mut store = self.credentials.lock().await;
            negotiator::check_authorized(status, token, &mut store)?;
        }
        if status != StatusCode::OK {
            warn!(status = status.as_u16(), %uri, "request not accepted");
        }
        Ok((status, body))
    }
}
