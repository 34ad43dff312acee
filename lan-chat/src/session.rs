use std::net::SocketAddr;

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    message::{BROADCAST, FrameReader, Message, SERVER_IDENTITY, write_message},
    registry::ConnectionHandle,
    router::{Routed, Router},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingIdentity,
    Active { identity: String },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

/// Server-side state of one accepted connection.
pub struct Session {
    handle: ConnectionHandle,
    router: Router,
    peer: Option<SocketAddr>,
    state: SessionState,
}

impl Session {
    pub fn new(router: Router, handle: ConnectionHandle, peer: Option<SocketAddr>) -> Self {
        Self {
            handle,
            router,
            peer,
            state: SessionState::AwaitingIdentity,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&str> {
        match &self.state {
            SessionState::Active { identity } => Some(identity.as_str()),
            _ => None,
        }
    }

    pub async fn on_message(&mut self, message: Message) -> Step {
        match &self.state {
            SessionState::AwaitingIdentity => self.on_handshake(message).await,
            SessionState::Active { identity } => {
                let identity = identity.clone();
                match self.router.route(&identity, message).await {
                    Routed::Disconnect => {
                        info!(peer = ?self.peer, %identity, "client requested disconnect");
                        Step::Stop
                    }
                    Routed::Delivered(_) | Routed::Dropped => Step::Continue,
                }
            }
            SessionState::Closed => Step::Stop,
        }
    }

    async fn on_handshake(&mut self, message: Message) -> Step {
        let claimed = match message {
            Message::Connect { sender } => sender,
            Message::Disconnect { .. } => return Step::Stop,
            other => {
                debug!(peer = ?self.peer, tag = other.tag(), "ignoring message before connect");
                return Step::Continue;
            }
        };

        let identity = match validate_identity(&claimed) {
            Ok(identity) => identity,
            Err(reason) => {
                warn!(peer = ?self.peer, identity = %claimed, reason, "refusing connect");
                self.handle.deliver(Message::Disconnect {
                    sender: SERVER_IDENTITY.to_string(),
                    content: Some(reason.to_string()),
                });
                return Step::Stop;
            }
        };

        self.router
            .registry()
            .register(&identity, self.handle.clone())
            .await;
        info!(peer = ?self.peer, %identity, "client joined");
        self.state = SessionState::Active { identity };
        Step::Continue
    }

    /// Tears the session down. Only the first call unregisters.
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Active { identity } = previous {
            let removed = self
                .router
                .registry()
                .unregister_connection(&identity, self.handle.id())
                .await;
            if removed {
                info!(peer = ?self.peer, %identity, "client disconnected");
            } else {
                debug!(peer = ?self.peer, %identity, "identity already rebound elsewhere");
            }
        }
    }

    async fn read_loop<R>(&mut self, frames: &mut FrameReader<R>) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match frames.next().await {
                Ok(Some(message)) => {
                    if self.on_message(message).await == Step::Stop {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(err) if err.is_recoverable() => {
                    warn!(peer = ?self.peer, error = %err, "discarding malformed frame");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn validate_identity(claimed: &str) -> Result<String, &'static str> {
    let identity = claimed.trim();
    if identity.is_empty() {
        return Err("identity cannot be empty");
    }
    // Clients read the sentinel loosely, so `all` would be unreachable privately.
    if identity.eq_ignore_ascii_case(BROADCAST) || identity == SERVER_IDENTITY {
        return Err("identity is reserved");
    }
    Ok(identity.to_string())
}

/// Drives one connection until the peer leaves or the stream fails, then
/// unregisters it. The outbound half is owned by a dedicated writer task.
pub async fn run<R, W>(reader: R, writer: W, router: Router, peer: Option<SocketAddr>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(router.registry().next_id(), outbound_tx);
    let writer_task = tokio::spawn(write_outbound(writer, outbound_rx));

    let mut session = Session::new(router, handle, peer);
    let mut frames = FrameReader::new(BufReader::new(reader));
    let result = session.read_loop(&mut frames).await;
    session.close().await;
    drop(session);

    // Lets queued frames (a refusal reason, say) reach the peer first.
    if let Err(err) = writer_task.await {
        warn!(peer = ?peer, error = ?err, "writer task failed");
    }
    result
}

async fn write_outbound<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        if let Err(err) = write_message(&mut writer, &message).await {
            debug!(?err, "failed to deliver message to client");
            break;
        }
    }
    outbound.close();

    if let Err(err) = writer.shutdown().await {
        debug!(?err, "failed to shut down writer");
    }
}
