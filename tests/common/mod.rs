//! A stand-in broker: plain and secured SPARQL endpoints, registration, token
//! requests and a subscription WebSocket, all on one local port.
#![allow(dead_code)]

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sepa_client::Configuration;
use sepa_client::credentials::basic_authorization;

pub const CLIENT_ID: &str = "id-1";
pub const CLIENT_SECRET: &str = "secret-1";

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Answer subscribe frames with a sequence "0" notification.
    pub confirm: bool,
    /// Deltas pushed right after the confirmation.
    pub notifications: usize,
    /// Push an error frame after the deltas.
    pub error_after_notifications: bool,
    /// Close the socket after the deltas.
    pub close_after_notifications: bool,
    /// Answer unsubscribe frames.
    pub confirm_unsubscribe: bool,
    /// Secured endpoints answer 401 to any token.
    pub reject_tokens: bool,
    pub register_status: StatusCode,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            confirm: true,
            notifications: 0,
            error_after_notifications: false,
            close_after_notifications: false,
            confirm_unsubscribe: true,
            reject_tokens: false,
            register_status: StatusCode::CREATED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub content_type: Option<String>,
    pub authorization: Option<String>,
    pub body: String,
}

#[derive(Default)]
pub struct Broker {
    pub options: Mutex<BrokerOptions>,
    pub requests: Mutex<Vec<Recorded>>,
    pub frames: Mutex<Vec<Value>>,
    pub registrations: AtomicUsize,
    pub tokens: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl Broker {
    fn options(&self) -> BrokerOptions {
        self.options.lock().unwrap().clone()
    }
    fn record(&self, path: &str, headers: &HeaderMap, body: String) {
        let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        self.requests.lock().unwrap().push(Recorded {
            path: path.to_string(),
            content_type: header(CONTENT_TYPE),
            authorization: header(AUTHORIZATION),
            body,
        });
    }
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }
    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().unwrap().clone()
    }
    fn current_token(&self) -> String {
        format!("token-{}", self.tokens.load(Ordering::SeqCst))
    }
}

pub struct MockBroker {
    pub addr: SocketAddr,
    pub broker: Arc<Broker>,
}

impl MockBroker {
    pub async fn start(options: BrokerOptions) -> Self {
        let broker = Arc::new(Broker { options: Mutex::new(options), ..Default::default() });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&broker));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, broker }
    }

    /// The configuration of this broker, with every secured URI pointed at the
    /// plain listener.
    pub fn configuration(&self) -> Configuration {
        let port = self.addr.port();
        let jsap = format!(
            r#"{{
                "host": "127.0.0.1",
                "sparql11protocol": {{"protocol": "http", "port": {port},
                    "query": {{"path": "/query"}}, "update": {{"path": "/update"}}}},
                "sparql11seprotocol": {{"protocol": "ws",
                    "availableProtocols": {{"ws": {{"port": {port}, "path": "/subscribe"}},
                                            "wss": {{"port": {port}, "path": "/subscribe"}}}},
                    "security": {{"port": {port}, "registration": "/oauth/register",
                                  "tokenRequest": "/oauth/token", "securePath": "/secure"}}}},
                "namespaces": {{"ex": "http://ex.org/"}},
                "queries": {{
                    "all": {{"sparql": "SELECT ?s ?p ?o WHERE {{ ?s ?p ?o }}"}},
                    "name_of": {{"sparql": "SELECT ?name WHERE {{ ?person ex:name ?name }}",
                                 "forcedBindings": {{"person": {{"type": "uri"}}}}}},
                    "broken": {{"sparql": "SELECT BROKEN"}}
                }},
                "updates": {{
                    "set_name": {{"sparql": "INSERT DATA {{ ?person ex:name ?name . }}",
                                  "forcedBindings": {{"person": {{"type": "uri"}}, "name": {{"type": "literal"}}}}}}
                }}
            }}"#
        );
        let mut configuration = Configuration::from_jsap_str(&jsap).unwrap();
        let plain = |uri: &mut Option<String>| {
            if let Some(uri) = uri {
                *uri = uri.replacen("https://", "http://", 1).replacen("wss://", "ws://", 1);
            }
        };
        plain(&mut configuration.secure_query_uri);
        plain(&mut configuration.secure_update_uri);
        plain(&mut configuration.secure_subscribe_uri);
        plain(&mut configuration.token_request_uri);
        plain(&mut configuration.register_uri);
        configuration
    }
}

fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/query", post(query))
        .route("/update", post(update))
        .route("/secure/query", post(secure_query))
        .route("/secure/update", post(secure_update))
        .route("/oauth/register", post(register))
        .route("/oauth/token", post(token))
        .route("/subscribe", get(subscribe))
        .route("/secure/subscribe", get(subscribe))
        .with_state(broker)
}

// ------------- HTTP -------------
fn query_answer(body: &str) -> (StatusCode, String) {
    if body.contains("BROKEN") {
        return (StatusCode::OK, json!({"error": {"message": "parse error"}}).to_string());
    }
    let answer = json!({"head": {"vars": ["s", "p", "o"]}, "results": {"bindings": []}});
    (StatusCode::OK, answer.to_string())
}

async fn query(State(broker): State<Arc<Broker>>, headers: HeaderMap, body: String) -> (StatusCode, String) {
    broker.record("/query", &headers, body.clone());
    query_answer(&body)
}

async fn update(State(broker): State<Arc<Broker>>, headers: HeaderMap, body: String) -> (StatusCode, String) {
    broker.record("/update", &headers, body);
    (StatusCode::OK, "{}".into())
}

fn bearer_accepted(broker: &Broker, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", broker.current_token());
    !broker.options().reject_tokens
        && headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some(expected.as_str())
}

async fn secure_query(State(broker): State<Arc<Broker>>, headers: HeaderMap, body: String) -> (StatusCode, String) {
    broker.record("/secure/query", &headers, body.clone());
    if !bearer_accepted(&broker, &headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized".into());
    }
    query_answer(&body)
}

async fn secure_update(State(broker): State<Arc<Broker>>, headers: HeaderMap, body: String) -> (StatusCode, String) {
    broker.record("/secure/update", &headers, body);
    if !bearer_accepted(&broker, &headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized".into());
    }
    (StatusCode::OK, "{}".into())
}

async fn register(State(broker): State<Arc<Broker>>, headers: HeaderMap, body: String) -> (StatusCode, String) {
    broker.record("/oauth/register", &headers, body);
    let status = broker.options().register_status;
    if status != StatusCode::CREATED {
        return (status, "registration closed".into());
    }
    broker.registrations.fetch_add(1, Ordering::SeqCst);
    (status, json!({"client_id": CLIENT_ID, "client_secret": CLIENT_SECRET}).to_string())
}

async fn token(State(broker): State<Arc<Broker>>, headers: HeaderMap, body: String) -> (StatusCode, String) {
    broker.record("/oauth/token", &headers, body);
    let expected = basic_authorization(CLIENT_ID, CLIENT_SECRET);
    if headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return (StatusCode::UNAUTHORIZED, "unknown client".into());
    }
    let issued = broker.tokens.fetch_add(1, Ordering::SeqCst) + 1;
    let answer = json!({"token": {"access_token": format!("token-{issued}"), "expires_in": 3600}});
    (StatusCode::CREATED, answer.to_string())
}

// ------------- WebSocket -------------
async fn subscribe(State(broker): State<Arc<Broker>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| channel(socket, broker))
}

async fn send(socket: &mut WebSocket, frame: Value) -> bool {
    socket.send(Message::Text(frame.to_string())).await.is_ok()
}

async fn channel(mut socket: WebSocket, broker: Arc<Broker>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
        broker.frames.lock().unwrap().push(frame.clone());
        let options = broker.options();

        if let Some(subscribe) = frame.get("subscribe") {
            if !options.confirm {
                continue;
            }
            let spuid = format!("sub-{}", broker.subscriptions.fetch_add(1, Ordering::SeqCst) + 1);
            let alias = frame.get("alias").cloned().unwrap_or(Value::Null);
            if !send(&mut socket, json!({"notification": {"sequence": "0", "spuid": spuid, "alias": alias}})).await {
                return;
            }
            // not part of the protocol, the client logs and ignores it
            if !send(&mut socket, json!({"ping": {"sparql": subscribe["sparql"]}})).await {
                return;
            }
            for sequence in 1..=options.notifications {
                let delta = json!({"notification": {
                    "sequence": sequence.to_string(),
                    "spuid": spuid,
                    "addedResults": {"bindings": [{"n": sequence}]},
                    "removedResults": {"bindings": []}
                }});
                if !send(&mut socket, delta).await {
                    return;
                }
            }
            if options.error_after_notifications {
                let _ = send(&mut socket, json!({"error": {"status_code": 500, "message": "overloaded"}})).await;
            }
            if options.close_after_notifications {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        } else if let Some(unsubscribe) = frame.get("unsubscribe") {
            if options.confirm_unsubscribe {
                let _ = send(&mut socket, json!({"unsubscribed": {"spuid": unsubscribe["spuid"]}})).await;
            }
        }
    }
}
