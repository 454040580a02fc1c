//! Broker configuration: endpoints, namespaces and named SPARQL templates.
//!
//! The same document can be written as JSON (`.jsap`) or YAML (`.ysap`). Each
//! format has a loader implementing [`ConfigurationFormat`]; both produce a
//! [`SapDocument`], which [`Configuration::from_document`] resolves into the
//! immutable [`Configuration`] used by the client. All URIs are resolved here,
//! templates are only rendered on request.

use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::binding::{self, Bindings, ForcedBindingSpec, Namespaces, SubstitutionMode};
use crate::error::{Result, SepaError, TemplateKind};

// ------------- Document -------------
#[derive(Debug, Clone, Deserialize)]
pub struct SapDocument {
    pub host: String,
    pub sparql11protocol: Sparql11Protocol,
    pub sparql11seprotocol: Sparql11SeProtocol,
    pub namespaces: IndexMap<String, String>,
    pub queries: IndexMap<String, Template>,
    pub updates: IndexMap<String, Template>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sparql11Protocol {
    pub host: Option<String>,
    pub protocol: String,
    pub port: u16,
    pub query: Endpoint,
    pub update: Endpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sparql11SeProtocol {
    pub host: Option<String>,
    pub protocol: String,
    pub available_protocols: AvailableProtocols,
    pub security: Option<Security>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvailableProtocols {
    pub ws: SocketEndpoint,
    pub wss: SocketEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketEndpoint {
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    pub host: Option<String>,
    pub port: u16,
    pub registration: String,
    pub token_request: String,
    pub secure_path: String,
    pub expires: Option<serde_json::Value>,
}

/// A named SPARQL template and its declared forced bindings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub sparql: String,
    pub forced_bindings: Option<ForcedBindingSpec>,
}

impl Template {
    pub fn new(sparql: impl Into<String>) -> Self {
        Self { sparql: sparql.into(), forced_bindings: None }
    }
    pub fn with_bindings(sparql: impl Into<String>, forced_bindings: ForcedBindingSpec) -> Self {
        Self { sparql: sparql.into(), forced_bindings: Some(forced_bindings) }
    }
}

// ------------- Loaders -------------
/// A textual format a [`SapDocument`] can be read from.
pub trait ConfigurationFormat {
    const NAME: &'static str;
    fn parse(text: &str) -> Result<SapDocument>;
}

/// JSON documents (`.jsap`).
pub struct Jsap;

impl ConfigurationFormat for Jsap {
    const NAME: &'static str = "JSAP";
    fn parse(text: &str) -> Result<SapDocument> {
        serde_json::from_str(text).map_err(|e| SepaError::ConfigParsing(format!("{}: {e}", Self::NAME)))
    }
}

/// YAML documents (`.ysap`).
pub struct Ysap;

impl ConfigurationFormat for Ysap {
    const NAME: &'static str = "YSAP";
    fn parse(text: &str) -> Result<SapDocument> {
        serde_yaml::from_str(text).map_err(|e| SepaError::ConfigParsing(format!("{}: {e}", Self::NAME)))
    }
}

// ------------- Configuration -------------
#[derive(Debug, Clone)]
pub struct Configuration {
    pub host: String,
    pub query_host: Option<String>,
    pub protocol: String,
    pub port: u16,
    pub query_path: String,
    pub update_path: String,
    pub subscribe_host: Option<String>,
    pub subscribe_protocol: String,
    pub ws_port: u16,
    pub ws_path: String,
    pub wss_port: u16,
    pub wss_path: String,
    pub security: Option<Security>,

    pub query_uri: String,
    pub update_uri: String,
    pub subscribe_uri: String,
    pub secure_query_uri: Option<String>,
    pub secure_update_uri: Option<String>,
    pub secure_subscribe_uri: Option<String>,
    pub token_request_uri: Option<String>,
    pub register_uri: Option<String>,

    pub namespaces: Namespaces,
    pub queries: IndexMap<String, Template>,
    pub updates: IndexMap<String, Template>,
}

impl Configuration {
    /// Loads a `.jsap` or `.ysap` file, the extension picks the format.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let text = |path: &Path| {
            fs::read_to_string(path)
                .map_err(|e| SepaError::ConfigParsing(format!("cannot read {}: {e}", path.display())))
        };
        let document = match extension.as_deref() {
            Some("jsap") => Jsap::parse(&text(path)?)?,
            Some("ysap") => Ysap::parse(&text(path)?)?,
            _ => {
                return Err(SepaError::ConfigParsing(format!(
                    "unsupported configuration file {}, expected .jsap or .ysap",
                    path.display()
                )));
            }
        };
        debug!(file = %path.display(), "configuration loaded");
        Self::from_document(document)
    }

    pub fn from_jsap_str(text: &str) -> Result<Self> {
        Self::from_document(Jsap::parse(text)?)
    }

    pub fn from_ysap_str(text: &str) -> Result<Self> {
        Self::from_document(Ysap::parse(text)?)
    }

    pub fn from_document(document: SapDocument) -> Result<Self> {
        let SapDocument { host, sparql11protocol: http, sparql11seprotocol: se, namespaces, queries, updates } = document;
        let query_host = http.host.clone().unwrap_or_else(|| host.clone());
        let subscribe_host = se.host.clone().unwrap_or_else(|| host.clone());
        let ws = &se.available_protocols.ws;
        let wss = &se.available_protocols.wss;

        let subscribe_uri = format!("ws://{subscribe_host}:{}{}", ws.port, ws.path);
        let update_uri = format!("http://{query_host}:{}{}", http.port, http.update.path);
        let query_uri = format!("http://{query_host}:{}{}", http.port, http.query.path);

        let (secure_subscribe_uri, secure_update_uri, secure_query_uri, token_request_uri, register_uri) =
            match &se.security {
                Some(security) => {
                    let secure_host = security.host.clone().unwrap_or_else(|| host.clone());
                    let (port, prefix) = (security.port, &security.secure_path);
                    (
                        Some(format!("wss://{subscribe_host}:{}{prefix}{}", wss.port, wss.path)),
                        Some(format!("https://{query_host}:{port}{prefix}{}", http.update.path)),
                        Some(format!("https://{query_host}:{port}{prefix}{}", http.query.path)),
                        Some(format!("https://{secure_host}:{port}{}", security.token_request)),
                        Some(format!("https://{secure_host}:{port}{}", security.registration)),
                    )
                }
                None => (None, None, None, None, None),
            };

        Ok(Self {
            host,
            query_host: http.host,
            protocol: http.protocol,
            port: http.port,
            query_path: http.query.path,
            update_path: http.update.path,
            subscribe_host: se.host,
            subscribe_protocol: se.protocol,
            ws_port: ws.port,
            ws_path: ws.path.clone(),
            wss_port: wss.port,
            wss_path: wss.path.clone(),
            security: se.security,
            query_uri,
            update_uri,
            subscribe_uri,
            secure_query_uri,
            secure_update_uri,
            secure_subscribe_uri,
            token_request_uri,
            register_uri,
            namespaces: Namespaces::try_from(namespaces)?,
            queries,
            updates,
        })
    }

    pub fn query(&self, name: &str) -> Result<&Template> {
        self.queries.get(name).ok_or_else(|| SepaError::TemplateNotFound {
            kind: TemplateKind::Query,
            name: name.to_string(),
        })
    }

    pub fn update(&self, name: &str) -> Result<&Template> {
        self.updates.get(name).ok_or_else(|| SepaError::TemplateNotFound {
            kind: TemplateKind::Update,
            name: name.to_string(),
        })
    }

    /// Renders a named query. A query without forced bindings is returned
    /// unsubstituted.
    pub fn query_text(&self, name: &str, bindings: &Bindings, mode: SubstitutionMode) -> Result<String> {
        let template = self.query(name)?;
        if template.forced_bindings.is_none() {
            debug!(query = name, "no forcedBindings declared");
        }
        binding::render(&template.sparql, template.forced_bindings.as_ref(), bindings, &self.namespaces, mode)
    }

    /// Renders a named update, which must declare forced bindings.
    pub fn update_text(&self, name: &str, bindings: &Bindings, mode: SubstitutionMode) -> Result<String> {
        let template = self.update(name)?;
        let declared = template
            .forced_bindings
            .as_ref()
            .ok_or_else(|| SepaError::ForcedBindingsMissing { name: name.to_string() })?;
        binding::render(&template.sparql, Some(declared), bindings, &self.namespaces, mode)
    }

    /// The prologue every rendered template starts with.
    pub fn namespace_prologue(&self) -> String {
        self.namespaces.prologue()
    }

    /// URIs needed before any secured operation: (register, token request).
    pub fn security_uris(&self) -> Result<(&str, &str)> {
        match (&self.register_uri, &self.token_request_uri) {
            (Some(register), Some(token)) => Ok((register, token)),
            _ => Err(SepaError::ConfigParsing("no security section in the configuration".into())),
        }
    }
}
