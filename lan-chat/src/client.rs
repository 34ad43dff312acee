use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::TransferError,
    message::{FrameReader, Message, Recipient, write_message},
    transfer::{self, FileReceiver, ReceiveEvent},
};

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Everything the front-end gets told about, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected {
        identity: String,
    },
    Chat {
        sender: String,
        content: String,
        private: bool,
    },
    UsersChanged(Vec<String>),
    Buzz {
        sender: String,
    },
    Typing {
        sender: String,
        active: bool,
    },
    FileOffered {
        sender: String,
        file_name: String,
        size: u64,
    },
    FileProgress {
        direction: Direction,
        percent: u8,
    },
    FileSaved {
        path: PathBuf,
    },
    FileSent {
        file_name: String,
        bytes: u64,
    },
    FileDeclined {
        file_name: String,
    },
    FileRejected {
        sender: String,
        file_name: String,
    },
    FileFailed {
        file_name: Option<String>,
        reason: String,
    },
    Disconnected {
        reason: Option<String>,
    },
}

enum Control {
    DeclineIncoming,
}

/// Client end of one chat connection.
///
/// Outgoing frames go through a bounded queue drained by a writer task, so
/// chat lines typed during a file upload are interleaved between chunks
/// rather than torn into them.
pub struct ChatClient {
    identity: String,
    outbound: mpsc::Sender<Message>,
    control: mpsc::Sender<Control>,
    events: mpsc::UnboundedSender<ClientEvent>,
    sending: Arc<AtomicBool>,
    closed: AtomicBool,
    reader_task: JoinHandle<()>,
}

impl ChatClient {
    pub async fn connect(
        server: SocketAddr,
        identity: &str,
        downloads: impl Into<PathBuf>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let stream = TcpStream::connect(server)
            .await
            .with_context(|| format!("failed to connect to {server}"))?;
        info!("connected to {server}");

        let (reader, writer) = stream.into_split();
        Self::start(BufReader::new(reader), writer, identity, downloads.into()).await
    }

    async fn start<R, W>(
        reader: R,
        writer: W,
        identity: &str,
        downloads: PathBuf,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_outbound(writer, outbound_rx));
        let reader_task = tokio::spawn(run_reader(
            reader,
            FileReceiver::new(downloads),
            control_rx,
            events_tx.clone(),
        ));

        let client = Self {
            identity: identity.to_string(),
            outbound: outbound_tx,
            control: control_tx,
            events: events_tx,
            sending: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            reader_task,
        };

        client
            .send(Message::Connect {
                sender: client.identity.clone(),
            })
            .await?;
        let _ = client.events.send(ClientEvent::Connected {
            identity: client.identity.clone(),
        });

        Ok((client, events_rx))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    /// Broadcasts when `recipient` is `ALL` in any case, otherwise sends privately.
    pub async fn send_text(&self, recipient: &str, content: &str) -> Result<()> {
        let message = match Recipient::parse_loose(recipient) {
            Recipient::All => Message::BroadcastChat {
                sender: self.identity.clone(),
                recipient: Recipient::All,
                content: content.to_string(),
            },
            Recipient::User(recipient) => Message::PrivateChat {
                sender: self.identity.clone(),
                recipient,
                content: content.to_string(),
            },
        };
        self.send(message).await
    }

    pub async fn send_buzz(&self, recipient: Recipient) -> Result<()> {
        self.send(Message::Buzz {
            sender: self.identity.clone(),
            recipient,
        })
        .await
    }

    pub async fn typing_start(&self, recipient: &str) -> Result<()> {
        self.send(Message::TypingStart {
            sender: self.identity.clone(),
            recipient: Recipient::user(recipient),
        })
        .await
    }

    pub async fn typing_stop(&self, recipient: &str) -> Result<()> {
        self.send(Message::TypingStop {
            sender: self.identity.clone(),
            recipient: Recipient::user(recipient),
        })
        .await
    }

    /// Starts uploading `path` in the background. Progress and the outcome
    /// arrive as events.
    pub fn send_file(
        &self,
        recipient: Recipient,
        path: PathBuf,
    ) -> Result<JoinHandle<()>, TransferError> {
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransferError::Busy);
        }

        let sending = Arc::clone(&self.sending);
        let outbound = self.outbound.clone();
        let events = self.events.clone();
        let identity = self.identity.clone();

        Ok(tokio::spawn(async move {
            let progress_events = events.clone();
            let result = transfer::send_file(&path, &identity, &recipient, &outbound, |percent| {
                let _ = progress_events.send(ClientEvent::FileProgress {
                    direction: Direction::Sending,
                    percent,
                });
            })
            .await;

            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            let event = match result {
                Ok(bytes) => ClientEvent::FileSent {
                    file_name: file_name.unwrap_or_default(),
                    bytes,
                },
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "file upload failed");
                    ClientEvent::FileFailed {
                        file_name,
                        reason: err.to_string(),
                    }
                }
            };
            let _ = events.send(event);
            sending.store(false, Ordering::Release);
        }))
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    /// Declines the incoming transfer, if any. The sender is not notified.
    pub async fn decline_incoming(&self) -> Result<()> {
        self.control
            .send(Control::DeclineIncoming)
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    /// Announces departure. Further calls do nothing.
    pub async fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(err) = self
            .send(Message::Disconnect {
                sender: self.identity.clone(),
                content: None,
            })
            .await
        {
            debug!(error = %err, "disconnect not delivered");
        }
        Ok(())
    }

    /// Waits until the server side of the connection is gone.
    pub async fn closed(self) {
        let ChatClient {
            outbound,
            reader_task,
            ..
        } = self;
        drop(outbound);
        if let Err(err) = reader_task.await {
            warn!(error = ?err, "reader task failed");
        }
    }
}

async fn write_outbound<W>(mut writer: W, mut outbound: mpsc::Receiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        if let Err(err) = write_message(&mut writer, &message).await {
            warn!(error = %err, "failed to send message to server");
            break;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(?err, "failed to shut down client writer cleanly");
    }
}

async fn run_reader<R>(
    reader: R,
    mut receiver: FileReceiver,
    mut control: mpsc::Receiver<Control>,
    events: mpsc::UnboundedSender<ClientEvent>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut frames = FrameReader::new(reader);
    let reason = loop {
        select! {
            server_message = frames.next() => {
                match server_message {
                    Ok(Some(message)) => {
                        if let Some(reason) = handle_server_message(message, &mut receiver, &events).await {
                            break reason;
                        }
                    }
                    Ok(None) => break None,
                    Err(err) if err.is_recoverable() => {
                        warn!(error = %err, "discarding malformed frame from server");
                    }
                    Err(err) => break Some(err.to_string()),
                }
            }
            Some(command) = control.recv() => match command {
                Control::DeclineIncoming => {
                    if let Some(file_name) = receiver.decline().await {
                        let _ = events.send(ClientEvent::FileDeclined { file_name });
                    }
                }
            },
        }
    };

    if let Some(file_name) = receiver.abandon().await {
        let _ = events.send(ClientEvent::FileFailed {
            file_name: Some(file_name),
            reason: "connection closed".to_string(),
        });
    }
    let _ = events.send(ClientEvent::Disconnected { reason });
}

/// Returns `Some(reason)` when the server asked us to go away.
async fn handle_server_message(
    message: Message,
    receiver: &mut FileReceiver,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Option<Option<String>> {
    let event = match message {
        Message::BroadcastChat { sender, content, .. } => ClientEvent::Chat {
            sender,
            content,
            private: false,
        },
        Message::PrivateChat {
            sender, content, ..
        } => ClientEvent::Chat {
            sender,
            content,
            private: true,
        },
        Message::UserListUpdate { users, .. } => ClientEvent::UsersChanged(users),
        Message::Buzz { sender, .. } => ClientEvent::Buzz { sender },
        Message::TypingStart { sender, .. } => ClientEvent::Typing {
            sender,
            active: true,
        },
        Message::TypingStop { sender, .. } => ClientEvent::Typing {
            sender,
            active: false,
        },
        Message::Disconnect { content, .. } => return Some(content),
        Message::Connect { sender } => {
            debug!(%sender, "ignoring connect from server");
            return None;
        }
        transfer_message @ (Message::FileRequest { .. }
        | Message::FileChunk { .. }
        | Message::FileComplete { .. }
        | Message::FileReject { .. }) => match receiver.handle(&transfer_message).await {
            Ok(Some(event)) => match receive_event(event) {
                Some(event) => event,
                None => return None,
            },
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, tag = transfer_message.tag(), "incoming transfer failed");
                ClientEvent::FileFailed {
                    file_name: transfer_file_name(&transfer_message),
                    reason: err.to_string(),
                }
            }
        },
    };

    let _ = events.send(event);
    None
}

fn receive_event(event: ReceiveEvent) -> Option<ClientEvent> {
    match event {
        ReceiveEvent::Offered {
            sender,
            file_name,
            size,
        } => Some(ClientEvent::FileOffered {
            sender,
            file_name,
            size,
        }),
        ReceiveEvent::Progress { percent, .. } => Some(ClientEvent::FileProgress {
            direction: Direction::Receiving,
            percent,
        }),
        ReceiveEvent::Saved { path, .. } => Some(ClientEvent::FileSaved { path }),
        ReceiveEvent::Rejected { sender, file_name } => {
            Some(ClientEvent::FileRejected { sender, file_name })
        }
        ReceiveEvent::Discarded => None,
    }
}

fn transfer_file_name(message: &Message) -> Option<String> {
    match message {
        Message::FileRequest { file_name, .. }
        | Message::FileComplete { file_name, .. }
        | Message::FileReject { file_name, .. } => Some(file_name.clone()),
        _ => None,
    }
}
