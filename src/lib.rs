//! sepa-client – a client for SPARQL event processing (SEPA) brokers.
//!
//! A broker answers SPARQL 1.1 queries and updates over HTTP and keeps
//! *subscriptions* alive over WebSocket: once subscribed, every change to the
//! result set of a query is pushed to the client as a notification holding the
//! added and removed results.
//!
//! Everything the client knows about a broker comes from one configuration
//! document (JSON `.jsap` or YAML `.ysap`):
//! * endpoints for queries, updates and subscriptions, plain and secured,
//! * the namespace prefixes every request starts with,
//! * named query and update templates with *forced bindings*, the variables a
//!   caller fills in before the template is sent.
//!
//! ## Modules
//! * [`configuration`] – The [`Configuration`] value type and its JSAP/YSAP loaders.
//! * [`binding`] – Substitutes caller bindings into templates, as literals,
//!   IRIs or prefixed names.
//! * [`credentials`] – Client id, secret and bearer token, written through to a
//!   pluggable [`credentials::CredentialStorage`].
//! * [`negotiator`] – Registration and token requests in front of secured calls.
//! * [`protocol`] – The JSON frames of a subscription channel.
//! * [`subscription`] – One background task per live subscription.
//! * [`client`] – [`SepaClient`], the facade tying the above together.
//! * [`settings`] – Settings of the client itself, layered from defaults, a file and the environment.
//!
//! ## Security
//! Secured operations go through the negotiator first: a client without a
//! stored secret registers, a client without a token requests one, and both
//! steps are persisted before the request is sent with `Authorization: Bearer`.
//! A 401 answer drops the token and fails with [`SepaError::TokenExpired`];
//! retrying the operation acquires a fresh one.
//!
//! ## Quick Start
//! ```
//! use sepa_client::{Bindings, Configuration, SubstitutionMode};
//! let jsap = r#"{
//!     "host": "localhost",
//!     "sparql11protocol": {"protocol": "http", "port": 8000,
//!         "query": {"path": "/query"}, "update": {"path": "/update"}},
//!     "sparql11seprotocol": {"protocol": "ws", "availableProtocols": {
//!         "ws": {"port": 9000, "path": "/subscribe"}, "wss": {"port": 9443, "path": "/subscribe"}}},
//!     "namespaces": {"ex": "http://example.org/"},
//!     "queries": {"name_of": {"sparql": "SELECT ?name WHERE { ?person ex:name ?name }",
//!         "forcedBindings": {"person": {"type": "uri"}}}},
//!     "updates": {}
//! }"#;
//! let configuration = Configuration::from_jsap_str(jsap).unwrap();
//! assert_eq!(configuration.query_uri, "http://localhost:8000/query");
//! let bindings = Bindings::new().bind("person", "ex:alice");
//! let sparql = configuration.query_text("name_of", &bindings, SubstitutionMode::default()).unwrap();
//! assert_eq!(sparql, "PREFIX ex: <http://example.org/> SELECT ?name WHERE { ex:alice ex:name ?name }");
//! ```
//! Talking to a broker needs a runtime: build a [`SepaClient`] from the
//! configuration and call `query`, `update`, `subscribe` or `unsubscribe`.

pub mod binding;
pub mod client;
pub mod configuration;
pub mod credentials;
pub mod error;
pub mod negotiator;
pub mod protocol;
pub mod settings;
pub mod subscription;

pub use binding::{BindingKind, BindingSpec, Bindings, ForcedBindingSpec, Namespaces, SubstitutionMode};
pub use client::{SepaClient, SparqlResponse, SubscribeOptions};
pub use configuration::Configuration;
pub use error::{Result, SepaError};
pub use protocol::Notification;
pub use settings::ClientSettings;
pub use subscription::{NotificationHandler, SubscriptionManager, SubscriptionState};
