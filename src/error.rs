use thiserror::Error;

#[derive(Error, Debug)]
pub enum SepaError {
    #[error("Configuration error: {0}")]
    ConfigParsing(String),
    #[error("Settings error: {0}")]
    Settings(String),
    #[error("No {kind} named '{name}' in the configuration")]
    TemplateNotFound { kind: TemplateKind, name: String },
    #[error("Update '{name}' declares no forcedBindings")]
    ForcedBindingsMissing { name: String },
    #[error("Registration failed with status {status}: {body}")]
    RegistrationFailed { status: u16, body: String },
    #[error("Token request failed with status {status}: {body}")]
    TokenRequestFailed { status: u16, body: String },
    #[error("Token expired or rejected, retry the request")]
    TokenExpired,
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Credentials error: {0}")]
    Credentials(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, SepaError>;

/// Which template map a lookup went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Query,
    Update,
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateKind::Query => write!(f, "query"),
            TemplateKind::Update => write!(f, "update"),
        }
    }
}

// Helper conversions
impl From<reqwest::Error> for SepaError {
    fn from(e: reqwest::Error) -> Self { Self::Http(e.to_string()) }
}
impl From<tokio_tungstenite::tungstenite::Error> for SepaError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self { Self::SubscriptionFailed(e.to_string()) }
}
impl From<config::ConfigError> for SepaError {
    fn from(e: config::ConfigError) -> Self { Self::Settings(e.to_string()) }
}
impl From<serde_json::Error> for SepaError {
    fn from(e: serde_json::Error) -> Self { Self::Protocol(e.to_string()) }
}
impl From<serde_yaml::Error> for SepaError {
    fn from(e: serde_yaml::Error) -> Self { Self::Credentials(e.to_string()) }
}
impl From<std::io::Error> for SepaError {
    fn from(e: std::io::Error) -> Self { Self::Credentials(e.to_string()) }
}
impl<T> From<std::sync::PoisonError<T>> for SepaError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
