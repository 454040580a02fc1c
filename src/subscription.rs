//! Live subscriptions over WebSocket.
//!
//! Every subscription owns one channel, driven by one background task:
//!
//! ```text
//! Connecting --sequence "0"--> Active --unsubscribe sent--> Closing --"unsubscribed"--> Closed
//!      \                         \______________________________________________________/
//!       \___ timeout / channel closed before confirmation           channel closed
//! ```
//!
//! [`SubscriptionManager::subscribe`] returns once the broker has confirmed
//! the subscription and assigned its `spuid`, or fails with
//! `SubscriptionFailed` when that does not happen within the configured
//! timeout. The task then keeps dispatching notifications to the caller's
//! [`NotificationHandler`] in arrival order until the channel closes, for
//! whatever reason. Closing always removes the subscription from the live
//! set; the removal tolerates an id that is already gone.
//!
//! The live set is shared by the calling side and every channel task and is
//! only touched under its mutex, never across an await.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{Result, SepaError};
use crate::protocol::{self, Inbound, Notification};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receives what a subscription channel delivers. Called on the channel's
/// task, one call at a time, in the order frames arrive.
pub trait NotificationHandler: Send + Sync {
    fn on_notification(&self, notification: &Notification);
    fn on_error(&self, error: &Value) {
        let _ = error;
    }
}

impl<F> NotificationHandler for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn on_notification(&self, notification: &Notification) {
        self(notification)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

struct LiveSubscription {
    alias: Option<String>,
    authorization: Option<String>,
    state: SubscriptionState,
    outbound: mpsc::UnboundedSender<Message>,
    closed: watch::Receiver<bool>,
}

type LiveSet = Arc<Mutex<HashMap<String, LiveSubscription>>>;

/// Registry of the live subscriptions of one client.
#[derive(Clone)]
pub struct SubscriptionManager {
    live: LiveSet,
    timeout: Duration,
}

impl SubscriptionManager {
    pub fn new(timeout: Duration) -> Self {
        Self { live: Arc::new(Mutex::new(HashMap::new())), timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Opens a channel, sends the subscribe frame and waits for the broker's
    /// confirmation. Returns the confirmed `spuid`.
    pub async fn subscribe(
        &self,
        uri: &str,
        sparql: &str,
        alias: Option<&str>,
        authorization: Option<&str>,
        handler: Option<Arc<dyn NotificationHandler>>,
    ) -> Result<String> {
        debug!(%uri, ?alias, "connecting");
        // one deadline covers the handshake and the confirmation
        let deadline = Instant::now() + self.timeout;
        let (socket, _) = tokio::time::timeout_at(deadline, connect_async(uri))
            .await
            .map_err(|_| SepaError::SubscriptionFailed(format!("connecting to {uri} timed out")))?
            .map_err(|e| SepaError::SubscriptionFailed(format!("connecting to {uri}: {e}")))?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (confirmed, mut confirmed_rx) = oneshot::channel();
        let (closed_tx, closed) = watch::channel(false);
        let frame = protocol::subscribe_frame(sparql, alias, authorization)?;
        outbound
            .send(Message::Text(frame))
            .map_err(|_| SepaError::SubscriptionFailed("channel closed before subscribing".into()))?;

        let channel = Channel {
            live: Arc::clone(&self.live),
            handler,
            state: SubscriptionState::Connecting,
            pending: Some(Pending {
                confirmed,
                outbound,
                closed,
                alias: alias.map(str::to_string),
                authorization: authorization.map(str::to_string),
            }),
            spuid: None,
            closed: closed_tx,
        };
        let task = tokio::spawn(channel.run(socket, outbound_rx).instrument(info_span!("channel", %uri)));

        match tokio::time::timeout_at(deadline, &mut confirmed_rx).await {
            Ok(Ok(spuid)) => {
                info!(%spuid, ?alias, "subscribed");
                Ok(spuid)
            }
            Ok(Err(_)) => Err(SepaError::SubscriptionFailed(
                "channel closed before the subscription was confirmed".into(),
            )),
            Err(_) => {
                // a confirmation may have raced the deadline
                confirmed_rx.close();
                if let Ok(spuid) = confirmed_rx.try_recv() {
                    return Ok(spuid);
                }
                task.abort();
                Err(SepaError::SubscriptionFailed(format!(
                    "no confirmation within {} ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    /// Asks the broker to end a subscription and waits until its channel is
    /// gone from the live set. An unknown id is not an error.
    pub async fn unsubscribe(&self, spuid: &str) -> Result<()> {
        let mut closed = {
            let mut live = self.live.lock()?;
            let Some(entry) = live.get_mut(spuid) else {
                warn!(%spuid, "not a live subscription");
                return Ok(());
            };
            let frame = protocol::unsubscribe_frame(spuid, entry.authorization.as_deref())?;
            entry
                .outbound
                .send(Message::Text(frame))
                .map_err(|_| SepaError::SubscriptionFailed(format!("channel of {spuid} already closed")))?;
            entry.state = SubscriptionState::Closing;
            entry.closed.clone()
        };
        debug!(%spuid, "unsubscribe sent");
        match tokio::time::timeout(self.timeout, closed.wait_for(|done| *done)).await {
            Ok(_) => {
                info!(%spuid, "unsubscribed");
                Ok(())
            }
            Err(_) => Err(SepaError::SubscriptionFailed(format!(
                "no unsubscribe confirmation for {spuid} within {} ms",
                self.timeout.as_millis()
            ))),
        }
    }

    pub fn live_subscriptions(&self) -> Vec<String> {
        self.live.lock().map(|live| live.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn is_live(&self, spuid: &str) -> bool {
        self.live.lock().map(|live| live.contains_key(spuid)).unwrap_or(false)
    }

    pub fn state(&self, spuid: &str) -> SubscriptionState {
        self.live
            .lock()
            .ok()
            .and_then(|live| live.get(spuid).map(|entry| entry.state))
            .unwrap_or(SubscriptionState::Closed)
    }

    pub fn alias(&self, spuid: &str) -> Option<String> {
        self.live.lock().ok().and_then(|live| live.get(spuid).and_then(|entry| entry.alias.clone()))
    }

    /// Drops every channel without unsubscribing.
    pub fn close_all(&self) {
        if let Ok(mut live) = self.live.lock() {
            debug!(count = live.len(), "closing all channels");
            live.clear();
        }
    }
}

// ------------- Channel task -------------
struct Pending {
    confirmed: oneshot::Sender<String>,
    outbound: mpsc::UnboundedSender<Message>,
    closed: watch::Receiver<bool>,
    alias: Option<String>,
    authorization: Option<String>,
}

struct Channel {
    live: LiveSet,
    handler: Option<Arc<dyn NotificationHandler>>,
    state: SubscriptionState,
    pending: Option<Pending>,
    spuid: Option<String>,
    closed: watch::Sender<bool>,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

impl Channel {
    async fn run(mut self, mut socket: Socket, mut outbound: mpsc::UnboundedReceiver<Message>) {
        loop {
            tokio::select! {
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.on_text(&text) == Flow::Stop {
                            let _ = socket.close(None).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "closed by broker");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "channel failed");
                        self.report_error(&json!({ "message": e.to_string() }));
                        break;
                    }
                    None => break,
                },
                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = socket.send(message).await {
                            warn!(error = %e, "sending failed");
                            self.report_error(&json!({ "message": e.to_string() }));
                            break;
                        }
                    }
                    None => {
                        debug!("released, closing channel");
                        let _ = socket.close(None).await;
                        break;
                    }
                },
            }
        }
    }

    fn transition(&mut self, to: SubscriptionState) {
        debug!(spuid = ?self.spuid, from = ?self.state, ?to, "state change");
        self.state = to;
    }

    fn on_text(&mut self, text: &str) -> Flow {
        match protocol::classify(text) {
            Err(e) => {
                warn!(error = %e, frame = %text, "malformed frame ignored");
                Flow::Continue
            }
            Ok(Inbound::Notification(notification)) if notification.is_confirmation() => self.confirm(notification.spuid),
            Ok(Inbound::Notification(notification)) => {
                debug!(spuid = %notification.spuid, sequence = %notification.sequence, "notification");
                if let Some(handler) = &self.handler {
                    handler.on_notification(&notification);
                }
                Flow::Continue
            }
            Ok(Inbound::Error(e)) => {
                error!(error = %e, "broker reported an error");
                self.report_error(&e);
                Flow::Continue
            }
            Ok(Inbound::Unsubscribed { spuid }) if self.spuid.as_deref() == Some(spuid.as_str()) => {
                self.transition(SubscriptionState::Closing);
                Flow::Stop
            }
            Ok(Inbound::Unsubscribed { spuid }) => {
                warn!(%spuid, "unsubscribe confirmation for another subscription ignored");
                Flow::Continue
            }
            Ok(Inbound::Unknown(frame)) => {
                warn!(%frame, "unknown message ignored");
                Flow::Continue
            }
        }
    }

    fn confirm(&mut self, spuid: String) -> Flow {
        let Some(pending) = self.pending.take() else {
            debug!(%spuid, "repeated confirmation ignored");
            return Flow::Continue;
        };
        let entry = LiveSubscription {
            alias: pending.alias,
            authorization: pending.authorization,
            state: SubscriptionState::Active,
            outbound: pending.outbound,
            closed: pending.closed,
        };
        match self.live.lock() {
            Ok(mut live) => {
                live.insert(spuid.clone(), entry);
            }
            Err(e) => {
                error!(error = %e, "live set poisoned");
                return Flow::Stop;
            }
        }
        self.spuid = Some(spuid.clone());
        self.transition(SubscriptionState::Active);
        if pending.confirmed.send(spuid).is_err() {
            warn!("subscriber stopped waiting, closing");
            return Flow::Stop;
        }
        Flow::Continue
    }

    fn report_error(&self, error: &Value) {
        if let Some(handler) = &self.handler {
            handler.on_error(error);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(spuid) = self.spuid.take() {
            if let Ok(mut live) = self.live.lock() {
                if live.remove(&spuid).is_some() {
                    debug!(%spuid, "removed from live set");
                }
            }
        }
        self.state = SubscriptionState::Closed;
        debug!(state = ?self.state, "channel finished");
        self.closed.send_replace(true);
    }
}
