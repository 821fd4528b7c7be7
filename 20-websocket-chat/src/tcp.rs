use std::{future::Future, io, net::SocketAddr};

use anyhow::Result;
use futures::{Sink, Stream, sink, stream};
use serde::de::DeserializeOwned;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    broker::Broker,
    message::{ClientEvent, ServerEvent, read_message, write_message},
};

/// Chat front end speaking newline-delimited JSON over plain TCP.
pub struct TcpFrontend {
    listener: TcpListener,
    broker: Broker,
}

impl TcpFrontend {
    pub fn new(listener: TcpListener, broker: Broker) -> Self {
        Self { listener, broker }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. Open connections are
    /// closed by [`Broker::shutdown`], not by this loop.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let TcpFrontend { listener, broker } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("tcp front end stopped accepting");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &broker);
                }
            }
        }

        Ok(())
    }
}

fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, broker: &Broker) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, broker),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, broker: &Broker) {
    let broker = broker.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, broker).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Broker) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let connection = broker.connect().await;
    info!(conn = %connection.id(), %peer, "tcp client attached");

    connection
        .serve(
            line_events::<_, ClientEvent>(BufReader::new(reader)),
            line_sink(writer),
        )
        .await
}

/// Events read one JSON document per line.
///
/// Lines that do not decode to a known event are logged and skipped. A
/// partly received line stays buffered inside the stream, so dropping a
/// pending `next()` (for example in `select!`) loses nothing.
pub fn line_events<R, T>(reader: R) -> impl Stream<Item = io::Result<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    stream::unfold(reader, |mut reader| async move {
        loop {
            match read_message::<_, T>(&mut reader).await {
                Ok(Some(event)) => return Some((Ok(event), reader)),
                Ok(None) => return None,
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    warn!(error = %err, "skipping malformed line");
                }
                Err(err) => return Some((Err(err), reader)),
            }
        }
    })
}

/// Server events written one JSON document per line.
pub fn line_sink<W>(writer: W) -> impl Sink<ServerEvent, Error = io::Error>
where
    W: AsyncWrite + Unpin,
{
    sink::unfold(writer, |mut writer, event: ServerEvent| async move {
        write_message(&mut writer, &event).await?;
        Ok::<_, io::Error>(writer)
    })
}
