use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    select,
    sync::{Mutex, broadcast, watch},
};
use tracing::{debug, info, warn};

use crate::{
    dispatch::{Envelope, Inbound, Outcome, dispatch},
    message::{ClientEvent, ServerEvent},
    registry::{ConnectionId, SessionRegistry},
    welcome::{DelayedWelcome, WELCOME_FALLBACK, WelcomeSource, WelcomeTask},
};

pub const SHUTDOWN_NOTICE: &str = "server shutting down";

/// Shared chat state: the session registry and the fan-out channel.
///
/// Cloning is cheap; every connection task holds its own clone.
#[derive(Clone)]
pub struct Broker {
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(welcome: Arc<dyn WelcomeSource>) -> Self {
        Self {
            state: Arc::new(BrokerState::new(welcome)),
        }
    }

    pub fn with_welcome_delay(delay: Duration) -> Self {
        Self::new(Arc::new(DelayedWelcome::new(delay)))
    }

    /// Registers a new anonymous connection.
    ///
    /// The connection is subscribed to the fan-out channel before its session
    /// exists, so it cannot miss anything addressed to it. Drive it with
    /// [`Connection::serve`], which also tears the session down.
    pub async fn connect(&self) -> Connection {
        let inbox = self.state.broadcaster.subscribe();
        let closing = self.state.closing.subscribe();
        let id = self.state.next_id();
        let mut sessions = self.state.sessions.lock().await;
        sessions.open(id);
        info!(conn = %id, sessions = sessions.len(), "client connected");
        drop(sessions);

        Connection {
            id,
            broker: self.clone(),
            inbox,
            closing,
            welcome: None,
        }
    }

    #[cfg(test)]
    pub(crate) async fn usernames(&self) -> Vec<String> {
        self.state.sessions.lock().await.usernames()
    }

    #[cfg(test)]
    pub(crate) async fn session_count(&self) -> usize {
        self.state.sessions.lock().await.len()
    }

    /// Tells every client the server is going away and closes their connections.
    pub fn shutdown(&self) {
        info!("broker shutting down");
        self.state
            .publish(Envelope::everyone(ServerEvent::system(SHUTDOWN_NOTICE)));
        self.state.closing.send_replace(true);
    }

    /// Runs one inbound event through the dispatcher and publishes the result.
    ///
    /// The registry lock is held until every envelope is on the channel, so all
    /// connections observe outbound events in one global order.
    async fn handle(&self, conn: ConnectionId, inbound: Inbound) -> Option<WelcomeTask> {
        let mut sessions = self.state.sessions.lock().await;
        match &inbound {
            Inbound::SetUsername(name) => info!(%conn, username = %name, "username set"),
            Inbound::Disconnect => {
                info!(%conn, username = ?sessions.username(conn), "client disconnected")
            }
            Inbound::ChatMessage(text) if sessions.username(conn).is_none() => {
                info!(%conn, %text, "rejected message from anonymous client")
            }
            other => debug!(%conn, event = ?other, "client event"),
        }

        let Outcome {
            envelopes,
            schedule_welcome: owes_welcome,
        } = dispatch(&mut sessions, conn, inbound);
        for envelope in envelopes {
            self.state.publish(envelope);
        }
        drop(sessions);

        owes_welcome.then(|| self.schedule_welcome(conn))
    }

    fn schedule_welcome(&self, conn: ConnectionId) -> WelcomeTask {
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let text = match state.welcome.fetch().await {
                Ok(text) => text,
                Err(err) => {
                    warn!(%conn, error = ?err, "failed to fetch welcome message");
                    WELCOME_FALLBACK.to_string()
                }
            };
            state.publish(Envelope::only(conn, ServerEvent::SystemMessage(text)));
        });
        WelcomeTask::new(conn, handle)
    }
}

struct BrokerState {
    sessions: Mutex<SessionRegistry>,
    broadcaster: broadcast::Sender<Envelope>,
    closing: watch::Sender<bool>,
    next_id: AtomicU64,
    welcome: Arc<dyn WelcomeSource>,
}

impl BrokerState {
    fn new(welcome: Arc<dyn WelcomeSource>) -> Self {
        // Broadcast channel buffers a modest number of messages before lagging clients get warned.
        let (broadcaster, _) = broadcast::channel(128);
        let (closing, _) = watch::channel(false);
        Self {
            sessions: Mutex::new(SessionRegistry::new()),
            broadcaster,
            closing,
            next_id: AtomicU64::new(1),
            welcome,
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn publish(&self, envelope: Envelope) {
        // Sending only fails when no connection is subscribed.
        if let Err(error) = self.broadcaster.send(envelope) {
            debug!(?error, "no connections to deliver to");
        }
    }
}

/// One client's place in the chat, from connect until [`Connection::serve`] returns.
pub struct Connection {
    id: ConnectionId,
    broker: Broker,
    inbox: broadcast::Receiver<Envelope>,
    closing: watch::Receiver<bool>,
    welcome: Option<WelcomeTask>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Pumps client events into the broker and matching broker events back out
    /// until the client goes away or the broker shuts down, then disconnects.
    pub async fn serve<S, K, E>(mut self, inbound: S, outbound: K) -> Result<()>
    where
        S: Stream<Item = Result<ClientEvent, E>>,
        K: Sink<ServerEvent>,
        K::Error: std::fmt::Debug,
        E: std::error::Error + Send + Sync + 'static,
    {
        tokio::pin!(inbound);
        tokio::pin!(outbound);

        let result = self.run_session(inbound, outbound).await;
        self.close().await;
        result
    }

    async fn run_session<S, K, E>(
        &mut self,
        mut inbound: Pin<&mut S>,
        mut outbound: Pin<&mut K>,
    ) -> Result<()>
    where
        S: Stream<Item = Result<ClientEvent, E>>,
        K: Sink<ServerEvent>,
        K::Error: std::fmt::Debug,
        E: std::error::Error + Send + Sync + 'static,
    {
        loop {
            select! {
                biased;
                envelope = self.inbox.recv() => {
                    if !forward(self.id, envelope, &mut outbound).await {
                        break;
                    }
                }
                event = inbound.next() => match event {
                    Some(Ok(event)) => self.receive(event).await,
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                },
                // Ranked after the inbox so the shutdown notice is forwarded first.
                _ = closing(&mut self.closing) => break,
            }
        }

        Ok(())
    }

    async fn receive(&mut self, event: ClientEvent) {
        if let Some(task) = self.broker.handle(self.id, event.into()).await {
            self.welcome = Some(task);
        }
    }

    async fn close(mut self) {
        if let Some(task) = self.welcome.take() {
            task.cancel();
        }
        self.broker.handle(self.id, Inbound::Disconnect).await;
    }
}

/// Resolves once the broker starts shutting down, immediately if it already has.
async fn closing(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|closing| *closing).await;
}

/// Writes one broadcast to the client if it is addressed to this connection.
///
/// Returns `false` once the client can no longer be written to.
async fn forward<K>(
    conn: ConnectionId,
    envelope: Result<Envelope, broadcast::error::RecvError>,
    outbound: &mut Pin<&mut K>,
) -> bool
where
    K: Sink<ServerEvent>,
    K::Error: std::fmt::Debug,
{
    let event = match envelope {
        Ok(envelope) if envelope.audience.includes(conn) => envelope.event,
        Ok(_) => return true,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(%conn, skipped, "client lagging behind broadcasts");
            ServerEvent::system(format!(
                "you are behind by {skipped} messages; consider reconnecting"
            ))
        }
        Err(broadcast::error::RecvError::Closed) => return false,
    };

    if let Err(err) = outbound.send(event).await {
        debug!(%conn, ?err, "failed to deliver message to client");
        return false;
    }
    true
}
