use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{Html, IntoResponse},
    routing::get,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    broker::Broker,
    message::{ClientEvent, ServerEvent, decode, encode},
    tcp::TcpFrontend,
    welcome::DEFAULT_WELCOME_DELAY,
};

pub const DEFAULT_PORT: u16 = 3001;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Where to listen and how to greet newcomers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listener serving the chat page and the WebSocket endpoint.
    pub http_addr: SocketAddr,
    /// Optional newline-delimited JSON listener for terminal clients.
    pub tcp_addr: Option<SocketAddr>,
    pub welcome_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            tcp_addr: None,
            welcome_delay: DEFAULT_WELCOME_DELAY,
        }
    }
}

/// Bound listeners plus the broker they share.
pub struct ChatServer {
    http: TcpListener,
    tcp: Option<TcpFrontend>,
    broker: Broker,
}

impl ChatServer {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let broker = Broker::with_welcome_delay(config.welcome_delay);

        let http = TcpListener::bind(config.http_addr)
            .await
            .with_context(|| format!("failed to bind http listener on {}", config.http_addr))?;

        let tcp = match config.tcp_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind tcp listener on {addr}"))?;
                Some(TcpFrontend::new(listener, broker.clone()))
            }
            None => None,
        };

        Ok(Self { http, tcp, broker })
    }

    pub fn http_addr(&self) -> io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn tcp_addr(&self) -> io::Result<Option<SocketAddr>> {
        self.tcp.as_ref().map(TcpFrontend::local_addr).transpose()
    }

    /// Serves until `shutdown` resolves, then says goodbye to every client.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ChatServer { http, tcp, broker } = self;
        let (stop_tx, stop_rx) = watch::channel(false);

        let tcp_task = tcp.map(|frontend| tokio::spawn(frontend.run_until(stopped(stop_rx))));

        let app = router(broker.clone());
        axum::serve(http, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                broker.shutdown();
                stop_tx.send_replace(true);
            })
            .await
            .context("http server failed")?;

        if let Some(task) = tcp_task {
            task.await.context("tcp front end panicked")??;
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// `GET /` serves the browser client, `GET /ws` upgrades into a chat connection.
pub fn router(broker: Broker) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .with_state(broker)
        .layer(TraceLayer::new_for_http())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn ws_handler(ws: WebSocketUpgrade, State(broker): State<Broker>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
}

async fn handle_socket(socket: WebSocket, broker: Broker) {
    let connection = broker.connect().await;
    let conn = connection.id();
    info!(%conn, "websocket client attached");

    let (sink, frames) = socket.split();
    if let Err(err) = connection
        .serve(frame_events(frames), frame_sink(sink))
        .await
    {
        warn!(%conn, error = ?err, "websocket connection closed with error");
    }
}

/// Client events carried in text frames. Undecodable frames are logged and
/// skipped; binary and control frames are ignored.
fn frame_events<S>(frames: S) -> impl Stream<Item = Result<ClientEvent, axum::Error>>
where
    S: Stream<Item = Result<Message, axum::Error>>,
{
    frames.filter_map(|frame| async move {
        match frame {
            Ok(Message::Text(text)) => match decode::<ClientEvent>(&text) {
                Ok(event) => Some(Ok(event)),
                Err(err) => {
                    warn!(error = %err, "skipping malformed frame");
                    None
                }
            },
            Ok(_) => None,
            Err(err) => Some(Err(err)),
        }
    })
}

fn frame_sink<K>(sink: K) -> impl Sink<ServerEvent, Error = axum::Error>
where
    K: Sink<Message, Error = axum::Error>,
{
    sink.with(|event: ServerEvent| async move {
        encode(&event).map(Message::Text).map_err(axum::Error::new)
    })
}
