use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{ClientEvent, ServerEvent, write_message},
    tcp::line_events,
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    write_message(&mut writer, &ClientEvent::SetUsername(args.nickname.clone())).await?;

    let server = line_events::<_, ServerEvent>(reader);
    let input = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(server, input, &mut writer).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Both inputs live for the whole loop; a read that loses the race keeps its
/// partial line for the next pass.
async fn run_client_loop<S, I, W>(server: S, mut input: Lines<I>, writer: &mut W) -> Result<()>
where
    S: Stream<Item = io::Result<ServerEvent>>,
    I: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::pin!(server);

    loop {
        select! {
            server_message = server.next() => {
                if !handle_server_message(server_message.transpose()).await? {
                    break;
                }
            }
            line = input.next_line() => {
                if !handle_stdin_input(line, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(message: io::Result<Option<ServerEvent>>) -> Result<bool> {
    match message? {
        Some(message) => {
            write_stdout(&render_server_event(&message)).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

/// What a line typed at the terminal asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(ClientEvent),
    Quit,
    Nothing,
}

fn parse_input(line: &str) -> Input {
    let text = line.trim_end();
    if text.is_empty() {
        return Input::Nothing;
    }

    if text.eq_ignore_ascii_case("/quit") {
        return Input::Quit;
    }
    if text.eq_ignore_ascii_case("/typing") {
        return Input::Send(ClientEvent::Typing);
    }
    if text.eq_ignore_ascii_case("/stop") {
        return Input::Send(ClientEvent::StopTyping);
    }
    if let Some(name) = text.strip_prefix("/nick ") {
        return Input::Send(ClientEvent::SetUsername(name.trim().to_string()));
    }

    Input::Send(ClientEvent::ChatMessage(text.to_string()))
}

async fn handle_stdin_input<W>(line: io::Result<Option<String>>, writer: &mut W) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(line) = line? else {
        return Ok(false);
    };

    match parse_input(&line) {
        Input::Nothing => Ok(true),
        Input::Quit => {
            write_stdout("*** leaving chat").await?;
            Ok(false)
        }
        Input::Send(event) => {
            write_message(writer, &event).await?;
            Ok(true)
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

fn render_server_event(event: &ServerEvent) -> String {
    match event {
        ServerEvent::SystemMessage(text) => format!("*** {text}"),
        ServerEvent::UserListUpdate(users) => format!("*** online: {}", users.join(", ")),
        ServerEvent::ChatMessage { user, msg } => format!("<{user}> {msg}"),
        ServerEvent::UserTyping(user) => format!("*** {user} is typing..."),
        ServerEvent::UserStoppedTyping(user) => format!("*** {user} stopped typing"),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::duplex, time::timeout};

    use super::*;
    use crate::message::{encode, read_message};

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn typing_while_a_server_line_is_half_received_loses_nothing() {
        let (mut server_side, client_side) = duplex(1024);
        let (mut keyboard, terminal) = duplex(1024);
        let (outgoing, peer) = duplex(1024);
        let mut peer = BufReader::new(peer);

        let server = line_events::<_, ServerEvent>(BufReader::new(client_side));
        let input = BufReader::new(terminal).lines();
        let session = tokio::spawn(async move {
            let mut outgoing = outgoing;
            run_client_loop(server, input, &mut outgoing).await
        });

        let line = format!(
            "{}\n",
            encode(&ServerEvent::ChatMessage {
                user: "alice".into(),
                msg: "split across reads".into()
            })
            .unwrap()
        );
        let (head, tail) = line.split_at(12);
        server_side.write_all(head.as_bytes()).await.unwrap();
        tokio::task::yield_now().await;

        keyboard.write_all(b"hi\n").await.unwrap();
        let sent = timeout(WAIT, read_message::<_, ClientEvent>(&mut peer))
            .await
            .expect("client forwarded input")
            .unwrap();
        assert_eq!(sent, Some(ClientEvent::ChatMessage("hi".into())));

        server_side.write_all(tail.as_bytes()).await.unwrap();
        drop(server_side);

        let result = timeout(WAIT, session).await.expect("loop ended").unwrap();
        assert!(result.is_ok(), "client loop failed: {result:?}");
        drop(keyboard);
    }

    #[test]
    fn terminal_lines_map_to_events() {
        assert_eq!(parse_input("\n"), Input::Nothing);
        assert_eq!(parse_input("/QUIT\n"), Input::Quit);
        assert_eq!(parse_input("/typing\n"), Input::Send(ClientEvent::Typing));
        assert_eq!(parse_input("/stop\n"), Input::Send(ClientEvent::StopTyping));
        assert_eq!(
            parse_input("/nick  bob \n"),
            Input::Send(ClientEvent::SetUsername("bob".into()))
        );
        assert_eq!(
            parse_input("hello there\r\n"),
            Input::Send(ClientEvent::ChatMessage("hello there".into()))
        );
    }

    #[test]
    fn server_events_render_as_lines() {
        assert_eq!(
            render_server_event(&ServerEvent::UserListUpdate(vec![
                "alice".into(),
                "bob".into()
            ])),
            "*** online: alice, bob"
        );
        assert_eq!(
            render_server_event(&ServerEvent::ChatMessage {
                user: "alice".into(),
                msg: "hi".into()
            }),
            "<alice> hi"
        );
        assert_eq!(
            render_server_event(&ServerEvent::UserTyping("bob".into())),
            "*** bob is typing..."
        );
        assert_eq!(
            render_server_event(&ServerEvent::system("bob has joined the chat!")),
            "*** bob has joined the chat!"
        );
    }
}
