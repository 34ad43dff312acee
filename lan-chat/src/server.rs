use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    message::{Message, SERVER_IDENTITY},
    registry::Registry,
    router::Router,
    session,
};

pub const DEFAULT_PORT: u16 = 50125;

pub struct Server {
    listener: TcpListener,
    router: Router,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            router: Router::new(Arc::new(Registry::new())),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.router.registry())
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, router } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&router).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &router);
                }
            }
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

async fn handle_shutdown(router: &Router) {
    info!("server shutting down");
    router
        .registry()
        .broadcast(Message::Disconnect {
            sender: SERVER_IDENTITY.to_string(),
            content: Some("server shutting down".to_string()),
        })
        .await;
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, router: &Router) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, router),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, router: &Router) {
    let router = router.clone();
    info!(peer = %peer, "connection accepted");
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        if let Err(err) = session::run(reader, writer, router, Some(peer)).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}
