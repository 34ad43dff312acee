use std::time::Duration;

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    client::{ChatClient, ClientEvent, Direction},
    console::{ConsoleCommand, HELP},
    message::SERVER_IDENTITY,
};

const GOODBYE_GRACE: Duration = Duration::from_secs(2);

pub async fn run(args: ClientArgs) -> Result<()> {
    let (client, mut events) = ChatClient::connect(args.server, &args.name, args.downloads.clone()).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let mut server_gone = run_client_loop(&client, &mut events, &mut stdin, &mut input).await?;
    if !server_gone {
        client.disconnect().await?;
        server_gone = timeout(GOODBYE_GRACE, drain_until_disconnected(&mut events))
            .await
            .is_ok();
    }

    if server_gone {
        client.closed().await;
    } else {
        warn!("server did not close the connection, leaving anyway");
    }

    Ok(())
}

async fn run_client_loop(
    client: &ChatClient,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<bool> {
    loop {
        input.clear();
        select! {
            event = events.recv() => {
                if !handle_event(event).await? {
                    return Ok(true);
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, client).await? {
                    return Ok(false);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                return Ok(false);
            }
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    match result {
        Ok(()) => info!("received ctrl-c, leaving chat"),
        Err(err) => warn!("failed to listen for ctrl-c: {err}"),
    }
}

async fn handle_event(event: Option<ClientEvent>) -> Result<bool> {
    match event {
        Some(ClientEvent::Disconnected { reason }) => {
            let line = match reason {
                Some(reason) => format!("*** disconnected: {reason}"),
                None => "*** server closed the connection".to_string(),
            };
            write_stdout(&line).await?;
            Ok(false)
        }
        Some(event) => {
            render_event(event).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    client: &ChatClient,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }
    if input.trim().is_empty() {
        return Ok(true);
    }

    let command = match ConsoleCommand::parse(input) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    match command {
        ConsoleCommand::Say { text } => client.send_text("ALL", &text).await?,
        ConsoleCommand::Msg { to, text } => {
            client.send_text(&to, &text).await?;
            write_stdout(&format!("[to {to}] {text}")).await?;
        }
        ConsoleCommand::Buzz { to } => client.send_buzz(to).await?,
        ConsoleCommand::Typing { to, active: true } => client.typing_start(&to).await?,
        ConsoleCommand::Typing { to, active: false } => client.typing_stop(&to).await?,
        ConsoleCommand::Send { to, path } => {
            let line = format!("*** sending {} to {to}", path.display());
            match client.send_file(to, path) {
                Ok(_) => write_stdout(&line).await?,
                Err(err) => write_stderr(&format!("!!! {err}")).await?,
            }
        }
        ConsoleCommand::Decline => client.decline_incoming().await?,
        ConsoleCommand::Help => {
            for line in HELP {
                write_stdout(line).await?;
            }
        }
        ConsoleCommand::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
    }
    Ok(true)
}

/// Waits for the server to close our connection after we said goodbye.
async fn drain_until_disconnected(events: &mut mpsc::UnboundedReceiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        if matches!(event, ClientEvent::Disconnected { .. }) {
            break;
        }
    }
}

async fn render_event(event: ClientEvent) -> io::Result<()> {
    match event {
        ClientEvent::Connected { identity } => {
            write_stdout(&format!("*** connected as {identity}")).await
        }
        ClientEvent::Chat {
            sender,
            content,
            private: false,
        } if sender == SERVER_IDENTITY => write_stdout(&format!("*** {content}")).await,
        ClientEvent::Chat {
            sender,
            content,
            private,
        } => {
            let prefix = if private { "[private] " } else { "" };
            write_stdout(&format!("{prefix}<{sender}> {content}")).await
        }
        ClientEvent::UsersChanged(users) => {
            write_stdout(&format!("*** users: {}", users.join(", "))).await
        }
        ClientEvent::Buzz { sender } => write_stdout(&format!("*** {sender} buzzed you\x07")).await,
        ClientEvent::Typing {
            sender,
            active: true,
        } => write_stdout(&format!("*** {sender} is typing...")).await,
        ClientEvent::Typing {
            sender,
            active: false,
        } => write_stdout(&format!("*** {sender} stopped typing")).await,
        ClientEvent::FileOffered {
            sender,
            file_name,
            size,
        } => {
            write_stdout(&format!(
                "*** {sender} is sending '{file_name}' ({} KB), /decline to refuse",
                size / 1024
            ))
            .await
        }
        ClientEvent::FileProgress { direction, percent } => {
            let verb = match direction {
                Direction::Sending => "sent",
                Direction::Receiving => "received",
            };
            write_stderr(&format!("... {percent}% {verb}")).await
        }
        ClientEvent::FileSaved { path } => {
            write_stdout(&format!("*** file saved: {}", path.display())).await
        }
        ClientEvent::FileSent { file_name, bytes } => {
            write_stdout(&format!("*** sent '{file_name}' ({bytes} bytes)")).await
        }
        ClientEvent::FileDeclined { file_name } => {
            write_stdout(&format!("*** declined '{file_name}', partial data removed")).await
        }
        ClientEvent::FileRejected { sender, file_name } => {
            write_stdout(&format!("*** {sender} rejected '{file_name}'")).await
        }
        ClientEvent::FileFailed { file_name, reason } => {
            let name = file_name.unwrap_or_else(|| "file".to_string());
            write_stderr(&format!("!!! transfer of '{name}' failed: {reason}")).await
        }
        ClientEvent::Disconnected { .. } => Ok(()),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
