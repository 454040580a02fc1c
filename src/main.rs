use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sepa_client::{
    Bindings, ClientSettings, Configuration, Notification, NotificationHandler, Result, SepaClient, SepaError,
    SubscribeOptions,
};

/// Talks to a SPARQL event processing broker described by a JSAP or YSAP file.
#[derive(Parser, Debug)]
#[command(name = "sepa-client", version, about, long_about = None)]
struct Cli {
    /// Client settings file (layered under SEPA_* environment variables)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Broker configuration, .jsap or .ysap
    configuration: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a named query and print its results
    Query {
        name: String,
        /// Forced binding as name=value, repeatable
        #[arg(short, long = "bind", value_parser = parse_binding)]
        bindings: Vec<(String, String)>,
        #[arg(long)]
        secure: bool,
    },
    /// Run a named update
    Update {
        name: String,
        #[arg(short, long = "bind", value_parser = parse_binding)]
        bindings: Vec<(String, String)>,
        #[arg(long)]
        secure: bool,
    },
    /// Subscribe to a named query and print notifications until Ctrl-C
    Subscribe {
        name: String,
        #[arg(short, long = "bind", value_parser = parse_binding)]
        bindings: Vec<(String, String)>,
        #[arg(long)]
        alias: Option<String>,
        #[arg(long)]
        secure: bool,
    },
}

fn parse_binding(text: &str) -> std::result::Result<(String, String), String> {
    text.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{text}'"))
}

fn init_tracing(settings: &ClientSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Forwards everything a channel delivers to the printing loop.
struct Forward(mpsc::UnboundedSender<Value>);

impl NotificationHandler for Forward {
    fn on_notification(&self, notification: &Notification) {
        let _ = self.0.send(json!({
            "spuid": notification.spuid,
            "sequence": notification.sequence,
            "alias": notification.alias,
            "addedResults": notification.added_results,
            "removedResults": notification.removed_results,
        }));
    }
    fn on_error(&self, error: &Value) {
        let _ = self.0.send(json!({ "error": error }));
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings = match ClientSettings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    init_tracing(&settings);
    if let Err(e) = run(cli, settings).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, settings: ClientSettings) -> Result<()> {
    let configuration = Arc::new(Configuration::from_file(&cli.configuration)?);
    let client = SepaClient::new(configuration, settings)?;
    match cli.command {
        Commands::Query { name, bindings, secure } => {
            let response = client.query(&name, &bindings.into_iter().collect(), secure).await?;
            print_response(response.success, &response.payload)
        }
        Commands::Update { name, bindings, secure } => {
            let response = client.update(&name, &bindings.into_iter().collect(), secure).await?;
            print_response(response.success, &response.payload)
        }
        Commands::Subscribe { name, bindings, alias, secure } => {
            let bindings: Bindings = bindings.into_iter().collect();
            cmd_subscribe(&client, &name, &bindings, alias, secure).await
        }
    }
}

fn print_response(success: bool, payload: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(payload)?);
    if success {
        Ok(())
    } else {
        Err(SepaError::Protocol("the broker did not accept the request".into()))
    }
}

async fn cmd_subscribe(
    client: &SepaClient,
    name: &str,
    bindings: &Bindings,
    alias: Option<String>,
    secure: bool,
) -> Result<()> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let mut options = SubscribeOptions::new().handler(Forward(sender));
    options.alias = alias;
    options.secure = secure;
    let spuid = client.subscribe(name, bindings, options).await?;
    info!(%spuid, "subscribed, Ctrl-C to stop");

    let mut notifications = UnboundedReceiverStream::new(receiver);
    loop {
        tokio::select! {
            next = notifications.next() => match next {
                Some(notification) => println!("{}", serde_json::to_string(&notification)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    if client.subscriptions().is_live(&spuid) {
        client.unsubscribe(&spuid).await?;
    }
    Ok(())
}
