use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::server::{DEFAULT_PORT, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server: browser clients over WebSocket, optional terminal clients over TCP.
    Serve(ServeArgs),
    /// Join a running server's TCP front end from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address the HTTP/WebSocket listener binds to.
    #[arg(long, env = "CHAT_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port for the HTTP/WebSocket listener. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Also accept newline-delimited JSON clients on this address.
    #[arg(long, env = "CHAT_TCP_LISTEN")]
    pub tcp_listen: Option<SocketAddr>,

    /// How long the welcome message takes to arrive after registering.
    #[arg(long, env = "WELCOME_DELAY_MS", default_value_t = 1500)]
    pub welcome_delay_ms: u64,
}

impl ServeArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            http_addr: SocketAddr::new(self.host, self.port),
            tcp_addr: self.tcp_listen,
            welcome_delay: Duration::from_millis(self.welcome_delay_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username registered as soon as the connection is up.
    #[arg(long)]
    pub nickname: String,

    /// Address of the server's TCP front end.
    #[arg(long, default_value = "127.0.0.1:3002")]
    pub server: SocketAddr,
}
