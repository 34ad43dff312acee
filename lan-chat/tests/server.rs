use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use lan_chat::{
    client::{ChatClient, ClientEvent},
    message::{Message, Recipient, read_message, write_message},
    registry::Registry,
    server::Server,
    transfer,
};
use tokio::{
    io::BufReader,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener);
        let addr = server.local_addr()?;
        let registry = server.registry();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

type Reader = BufReader<OwnedReadHalf>;

/// Connects and waits for our own join notice, so the identity is registered
/// by the time this returns.
async fn connect_and_join(addr: SocketAddr, identity: &str) -> Result<(Reader, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(
        &mut writer,
        &Message::Connect {
            sender: identity.to_string(),
        },
    )
    .await?;

    let joined = Message::server_notice(format!("{identity} has joined the chat."));
    loop {
        if next_message(&mut reader).await? == joined {
            return Ok((reader, writer));
        }
    }
}

async fn next_message(reader: &mut Reader) -> Result<Message> {
    timeout(READ_TIMEOUT, read_message(reader))
        .await
        .context("timed out waiting for a frame")??
        .ok_or_else(|| anyhow!("connection closed"))
}

/// Skips presence traffic and returns the next chat line from a user.
async fn next_user_chat(reader: &mut Reader) -> Result<Message> {
    loop {
        match next_message(reader).await? {
            Message::UserListUpdate { .. } => continue,
            Message::BroadcastChat { ref sender, .. } if sender == "Server" => continue,
            other => return Ok(other),
        }
    }
}

async fn next_event<F>(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut wanted: F,
) -> Result<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    loop {
        let event = timeout(READ_TIMEOUT, events.recv())
            .await
            .context("timed out waiting for client event")?
            .ok_or_else(|| anyhow!("event stream ended"))?;
        if wanted(&event) {
            return Ok(event);
        }
    }
}

async fn wait_for_users(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    expected: &[&str],
) -> Result<()> {
    next_event(events, |event| {
        matches!(event, ClientEvent::UsersChanged(users) if users == expected)
    })
    .await
    .map(|_| ())
}

#[tokio::test]
async fn private_chat_reaches_only_the_recipient() -> Result<()> {
    let server = TestServer::start().await?;
    let (_alice_reader, mut alice_writer) = connect_and_join(server.addr, "alice").await?;
    let (mut bob_reader, _bob_writer) = connect_and_join(server.addr, "bob").await?;
    let (mut carol_reader, _carol_writer) = connect_and_join(server.addr, "carol").await?;

    write_message(
        &mut alice_writer,
        &Message::PrivateChat {
            sender: "alice".into(),
            recipient: "bob".into(),
            content: "secret".into(),
        },
    )
    .await?;
    write_message(
        &mut alice_writer,
        &Message::BroadcastChat {
            sender: "alice".into(),
            recipient: Recipient::All,
            content: "public".into(),
        },
    )
    .await?;

    assert_eq!(
        next_user_chat(&mut bob_reader).await?,
        Message::PrivateChat {
            sender: "alice".into(),
            recipient: "bob".into(),
            content: "secret".into(),
        }
    );
    // Carol's first chat line is the broadcast that followed the private one.
    assert_eq!(
        next_user_chat(&mut carol_reader).await?,
        Message::BroadcastChat {
            sender: "alice".into(),
            recipient: Recipient::All,
            content: "public".into(),
        }
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn broadcast_is_echoed_to_the_sender() -> Result<()> {
    let server = TestServer::start().await?;
    let (mut alice_reader, mut alice_writer) = connect_and_join(server.addr, "alice").await?;
    let (mut bob_reader, _bob_writer) = connect_and_join(server.addr, "bob").await?;

    write_message(
        &mut alice_writer,
        &Message::BroadcastChat {
            sender: "mallory".into(),
            recipient: Recipient::All,
            content: "hi all".into(),
        },
    )
    .await?;

    let expected = Message::BroadcastChat {
        sender: "alice".into(),
        recipient: Recipient::All,
        content: "hi all".into(),
    };
    assert_eq!(next_user_chat(&mut bob_reader).await?, expected);
    assert_eq!(next_user_chat(&mut alice_reader).await?, expected);

    server.stop().await;
    Ok(())
}

async fn start_client(
    addr: SocketAddr,
    identity: &str,
    downloads: &Path,
) -> Result<(ChatClient, mpsc::UnboundedReceiver<ClientEvent>)> {
    ChatClient::connect(addr, identity, downloads.to_path_buf()).await
}

#[tokio::test]
async fn file_is_reassembled_at_the_recipient() -> Result<()> {
    let server = TestServer::start().await?;
    let workspace = tempfile::tempdir()?;
    let source = workspace.path().join("x.txt");
    let payload = b"twenty bytes of data".to_vec();
    assert_eq!(payload.len(), 20);
    std::fs::write(&source, &payload)?;

    let alice_downloads = workspace.path().join("alice");
    let bob_downloads = workspace.path().join("bob");
    let (alice, mut alice_events) = start_client(server.addr, "alice", &alice_downloads).await?;
    wait_for_users(&mut alice_events, &["alice"]).await?;
    let (_bob, mut bob_events) = start_client(server.addr, "bob", &bob_downloads).await?;
    wait_for_users(&mut alice_events, &["alice", "bob"]).await?;

    let upload = alice.send_file(Recipient::user("bob"), source)?;

    let offered = next_event(&mut bob_events, |event| {
        matches!(event, ClientEvent::FileOffered { .. })
    })
    .await?;
    assert_eq!(
        offered,
        ClientEvent::FileOffered {
            sender: "alice".into(),
            file_name: "x.txt".into(),
            size: 20,
        }
    );

    let saved = next_event(&mut bob_events, |event| {
        matches!(event, ClientEvent::FileSaved { .. })
    })
    .await?;
    let ClientEvent::FileSaved { path } = saved else {
        unreachable!();
    };
    assert_eq!(path, bob_downloads.join("x.txt"));
    assert_eq!(std::fs::read(&path)?, payload);
    assert!(!transfer::part_path(&bob_downloads, "x.txt").exists());

    let sent = next_event(&mut alice_events, |event| {
        matches!(event, ClientEvent::FileSent { .. })
    })
    .await?;
    assert_eq!(
        sent,
        ClientEvent::FileSent {
            file_name: "x.txt".into(),
            bytes: 20,
        }
    );
    upload.await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn orphan_chunk_does_not_break_later_transfers() -> Result<()> {
    let server = TestServer::start().await?;
    let workspace = tempfile::tempdir()?;
    let source = workspace.path().join("notes.md");
    let payload = vec![b'n'; transfer::CHUNK_SIZE + 17];
    std::fs::write(&source, &payload)?;

    let bob_downloads = workspace.path().join("bob");
    let (alice, mut alice_events) =
        start_client(server.addr, "alice", &workspace.path().join("alice")).await?;
    let (_bob, mut bob_events) = start_client(server.addr, "bob", &bob_downloads).await?;
    wait_for_users(&mut alice_events, &["alice", "bob"]).await?;

    alice
        .send(Message::FileChunk {
            sender: "alice".into(),
            recipient: Recipient::user("bob"),
            file_chunk: b"stray".to_vec(),
        })
        .await?;
    alice
        .send(Message::FileComplete {
            sender: "alice".into(),
            recipient: Recipient::user("bob"),
            file_name: "ghost.bin".into(),
        })
        .await?;

    alice.send_file(Recipient::user("bob"), source)?;

    let event = next_event(&mut bob_events, |event| {
        matches!(
            event,
            ClientEvent::FileSaved { .. } | ClientEvent::FileFailed { .. }
        )
    })
    .await?;
    assert_eq!(
        event,
        ClientEvent::FileSaved {
            path: bob_downloads.join("notes.md")
        }
    );
    assert_eq!(std::fs::read(bob_downloads.join("notes.md"))?, payload);
    assert!(!bob_downloads.join("ghost.bin").exists());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_unregisters_and_announces_departure() -> Result<()> {
    let server = TestServer::start().await?;
    let (mut alice_reader, _alice_writer) = connect_and_join(server.addr, "alice").await?;
    let (_bob_reader, mut bob_writer) = connect_and_join(server.addr, "bob").await?;

    write_message(
        &mut bob_writer,
        &Message::Disconnect {
            sender: "bob".into(),
            content: None,
        },
    )
    .await?;

    let departed = Message::server_notice("bob has left the chat.");
    while next_message(&mut alice_reader).await? != departed {}
    assert_eq!(
        next_message(&mut alice_reader).await?,
        Message::user_list(vec!["alice".into()])
    );
    assert_eq!(server.registry.snapshot().await, vec!["alice".to_string()]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn dropped_socket_is_treated_as_departure() -> Result<()> {
    let server = TestServer::start().await?;
    let (mut alice_reader, _alice_writer) = connect_and_join(server.addr, "alice").await?;
    let (bob_reader, bob_writer) = connect_and_join(server.addr, "bob").await?;
    drop(bob_reader);
    drop(bob_writer);

    let departed = Message::server_notice("bob has left the chat.");
    while next_message(&mut alice_reader).await? != departed {}
    assert_eq!(server.registry.snapshot().await, vec!["alice".to_string()]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_tells_clients_to_disconnect() -> Result<()> {
    let server = TestServer::start().await?;
    let (mut alice_reader, _alice_writer) = connect_and_join(server.addr, "alice").await?;

    server.stop().await;

    let goodbye = loop {
        match next_message(&mut alice_reader).await? {
            Message::Disconnect { content, .. } => break content,
            _ => continue,
        }
    };
    assert_eq!(goodbye.as_deref(), Some("server shutting down"));
    Ok(())
}

#[tokio::test]
async fn reserved_identity_is_refused_with_a_reason() -> Result<()> {
    let server = TestServer::start().await?;
    let stream = TcpStream::connect(server.addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(
        &mut writer,
        &Message::Connect {
            sender: "ALL".into(),
        },
    )
    .await?;

    let refusal = next_message(&mut reader).await?;
    assert!(matches!(
        refusal,
        Message::Disconnect {
            content: Some(_),
            ..
        }
    ));
    let eof = timeout(READ_TIMEOUT, read_message(&mut reader)).await??;
    assert!(eof.is_none());
    assert!(server.registry.is_empty().await);

    server.stop().await;
    Ok(())
}
