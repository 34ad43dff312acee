//! Chunked file transfer over an ordinary chat connection.
//!
//! A transfer is `FILE_REQUEST`, then any number of `FILE_CHUNK`s, then
//! `FILE_COMPLETE` (or `FILE_REJECT`). The sending side reads the source in
//! fixed-size blocks; the receiving side stages bytes in `<name>.part` inside
//! the downloads directory and renames it once the completion arrives.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    error::TransferError,
    message::{Message, Recipient},
};

pub const CHUNK_SIZE: usize = 8 * 1024;
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

const PART_SUFFIX: &str = ".part";

/// `floor(transferred * 100 / expected)`, capped at 100. An empty or unknown
/// size reports 0.
pub fn percent(transferred: u64, expected: u64) -> u8 {
    if expected == 0 {
        return 0;
    }
    let value = u128::from(transferred) * 100 / u128::from(expected);
    value.min(100) as u8
}

/// Reduces a peer-supplied name to a bare file name inside the downloads
/// directory.
pub fn sanitize_file_name(name: &str) -> Result<String, TransferError> {
    let candidate = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if candidate.is_empty() || candidate == "." || candidate == ".." {
        return Err(TransferError::InvalidFileName(name.to_string()));
    }
    Ok(candidate.to_string())
}

pub fn part_path(downloads: &Path, file_name: &str) -> PathBuf {
    downloads.join(format!("{file_name}{PART_SUFFIX}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    Offered {
        sender: String,
        file_name: String,
        size: u64,
    },
    Progress {
        file_name: String,
        received: u64,
        percent: u8,
    },
    Saved {
        file_name: String,
        path: PathBuf,
    },
    /// The peer withdrew or refused the transfer.
    Rejected {
        sender: String,
        file_name: String,
    },
    /// The message belonged to no open transfer and was dropped.
    Discarded,
}

struct IncomingTransfer {
    sender: String,
    file_name: String,
    expected: u64,
    received: u64,
    part: PathBuf,
    file: File,
}

enum Incoming {
    Idle,
    Receiving(IncomingTransfer),
    /// Declined locally; remaining chunks are dropped until the sender finishes.
    Declined { sender: String },
}

/// Receiver half of the transfer protocol. One per connection.
pub struct FileReceiver {
    downloads: PathBuf,
    state: Incoming,
}

impl FileReceiver {
    pub fn new(downloads: impl Into<PathBuf>) -> Self {
        Self {
            downloads: downloads.into(),
            state: Incoming::Idle,
        }
    }

    pub fn downloads(&self) -> &Path {
        &self.downloads
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, Incoming::Receiving(_))
    }

    /// `(received, expected)` for the open transfer.
    pub fn progress(&self) -> Option<(u64, u64)> {
        match &self.state {
            Incoming::Receiving(transfer) => Some((transfer.received, transfer.expected)),
            _ => None,
        }
    }

    /// Feeds a transfer message. Non-transfer messages yield `Ok(None)`.
    pub async fn handle(&mut self, message: &Message) -> Result<Option<ReceiveEvent>, TransferError> {
        let event = match message {
            Message::FileRequest {
                sender,
                file_name,
                file_size,
                ..
            } => self.begin(sender, file_name, *file_size).await?,
            Message::FileChunk {
                sender, file_chunk, ..
            } => self.write_chunk(sender, file_chunk).await?,
            Message::FileComplete { sender, .. } => self.complete(sender).await?,
            Message::FileReject {
                sender, file_name, ..
            } => self.rejected(sender, file_name).await,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Opens the staging file right away; chunks may arrive before the user
    /// has answered any prompt.
    pub async fn begin(
        &mut self,
        sender: &str,
        file_name: &str,
        size: u64,
    ) -> Result<ReceiveEvent, TransferError> {
        if let Some(previous) = self.abandon().await {
            warn!(file_name = %previous, "new file request replaces unfinished transfer");
        }

        let file_name = sanitize_file_name(file_name)?;
        fs::create_dir_all(&self.downloads).await?;
        let part = part_path(&self.downloads, &file_name);
        let file = File::create(&part).await?;

        info!(%sender, %file_name, size, "receiving file");
        self.state = Incoming::Receiving(IncomingTransfer {
            sender: sender.to_string(),
            file_name: file_name.clone(),
            expected: size,
            received: 0,
            part,
            file,
        });

        Ok(ReceiveEvent::Offered {
            sender: sender.to_string(),
            file_name,
            size,
        })
    }

    pub async fn write_chunk(
        &mut self,
        sender: &str,
        bytes: &[u8],
    ) -> Result<ReceiveEvent, TransferError> {
        let transfer = match &mut self.state {
            Incoming::Receiving(transfer) if transfer.sender == sender => transfer,
            Incoming::Receiving(transfer) => {
                warn!(%sender, owner = %transfer.sender, "chunk from a different sender, discarding");
                return Ok(ReceiveEvent::Discarded);
            }
            Incoming::Declined { .. } => {
                debug!(%sender, "dropping chunk of declined transfer");
                return Ok(ReceiveEvent::Discarded);
            }
            Incoming::Idle => {
                warn!(%sender, len = bytes.len(), "chunk with no open transfer, discarding");
                return Ok(ReceiveEvent::Discarded);
            }
        };

        if let Err(err) = transfer.file.write_all(bytes).await {
            self.abandon().await;
            return Err(err.into());
        }
        transfer.received += bytes.len() as u64;

        Ok(ReceiveEvent::Progress {
            file_name: transfer.file_name.clone(),
            received: transfer.received,
            percent: percent(transfer.received, transfer.expected),
        })
    }

    /// Closes the staging file and moves it to its final name, replacing any
    /// file already there. On rename failure the bytes stay in `.part`.
    pub async fn complete(&mut self, sender: &str) -> Result<ReceiveEvent, TransferError> {
        let mut transfer = match std::mem::replace(&mut self.state, Incoming::Idle) {
            Incoming::Receiving(transfer) if transfer.sender == sender => transfer,
            Incoming::Receiving(transfer) => {
                warn!(%sender, owner = %transfer.sender, "completion from a different sender, ignoring");
                self.state = Incoming::Receiving(transfer);
                return Ok(ReceiveEvent::Discarded);
            }
            Incoming::Declined { .. } => return Ok(ReceiveEvent::Discarded),
            Incoming::Idle => {
                warn!(%sender, "completion with no open transfer, discarding");
                return Ok(ReceiveEvent::Discarded);
            }
        };

        if let Err(err) = transfer.file.flush().await {
            drop(transfer.file);
            remove_part(&transfer.part).await;
            return Err(err.into());
        }
        drop(transfer.file);

        let destination = self.downloads.join(&transfer.file_name);
        if let Err(err) = fs::rename(&transfer.part, &destination).await {
            // Some platforms refuse to rename over an existing file.
            let retried = match remove_if_present(&destination).await {
                Ok(()) => fs::rename(&transfer.part, &destination).await,
                Err(remove_err) => Err(remove_err),
            };
            if let Err(retry_err) = retried {
                warn!(
                    error = %err,
                    retry_error = %retry_err,
                    part = %transfer.part.display(),
                    "rename failed, data left in staging file"
                );
                return Err(err.into());
            }
        }

        info!(file_name = %transfer.file_name, bytes = transfer.received, "file saved");
        Ok(ReceiveEvent::Saved {
            file_name: transfer.file_name,
            path: destination,
        })
    }

    /// Local refusal: closes and deletes the staging file. The sender is not
    /// told; its remaining chunks are dropped quietly.
    pub async fn decline(&mut self) -> Option<String> {
        if !self.is_active() {
            return None;
        }
        let Incoming::Receiving(transfer) = std::mem::replace(&mut self.state, Incoming::Idle) else {
            return None;
        };
        drop(transfer.file);
        remove_part(&transfer.part).await;
        info!(file_name = %transfer.file_name, "file declined");
        self.state = Incoming::Declined {
            sender: transfer.sender,
        };
        Some(transfer.file_name)
    }

    async fn rejected(&mut self, sender: &str, file_name: &str) -> ReceiveEvent {
        let owned = match &self.state {
            Incoming::Receiving(transfer) => transfer.sender == sender,
            Incoming::Declined { sender: owner } => owner == sender,
            Incoming::Idle => false,
        };
        if owned {
            self.abandon().await;
        }
        ReceiveEvent::Rejected {
            sender: sender.to_string(),
            file_name: file_name.to_string(),
        }
    }

    /// Drops whatever transfer is in flight and removes its staging file.
    /// Safe to call repeatedly.
    pub async fn abandon(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, Incoming::Idle) {
            Incoming::Receiving(transfer) => {
                drop(transfer.file);
                remove_part(&transfer.part).await;
                Some(transfer.file_name)
            }
            Incoming::Declined { .. } | Incoming::Idle => None,
        }
    }
}

async fn remove_part(part: &Path) {
    if let Err(err) = remove_if_present(part).await {
        warn!(error = %err, part = %part.display(), "failed to remove staging file");
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Sender-side counters, used only for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingTransfer {
    expected: u64,
    sent: u64,
}

impl OutgoingTransfer {
    pub fn new(expected: u64) -> Self {
        Self { expected, sent: 0 }
    }

    pub fn record(&mut self, bytes: usize) -> u8 {
        self.sent += bytes as u64;
        percent(self.sent, self.expected)
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }
}

/// Streams `path` to `recipient` as request, chunks, completion.
///
/// Oversized files are refused before anything is queued. A read error stops
/// the transfer without sending a completion. Returns the bytes sent.
pub async fn send_file<P>(
    path: &Path,
    sender: &str,
    recipient: &Recipient,
    outbound: &mpsc::Sender<Message>,
    mut on_progress: P,
) -> Result<u64, TransferError>
where
    P: FnMut(u8),
{
    let metadata = fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(TransferError::NotAFile(path.to_path_buf()));
    }
    let size = metadata.len();
    if size > MAX_FILE_SIZE {
        return Err(TransferError::TooLarge {
            size,
            limit: MAX_FILE_SIZE,
        });
    }
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TransferError::InvalidFileName(path.display().to_string()))?
        .to_string();
    let mut file = File::open(path).await?;

    push(
        outbound,
        Message::FileRequest {
            sender: sender.to_string(),
            recipient: recipient.clone(),
            file_name: file_name.clone(),
            file_size: size,
        },
    )
    .await?;

    let mut transfer = OutgoingTransfer::new(size);
    let mut block = vec![0u8; CHUNK_SIZE];
    loop {
        let filled = match fill_block(&mut file, &mut block).await {
            Ok(filled) => filled,
            Err(err) => {
                warn!(%file_name, error = %err, sent = transfer.sent(), "read failed, aborting transfer");
                return Err(err.into());
            }
        };
        if filled == 0 {
            break;
        }

        push(
            outbound,
            Message::FileChunk {
                sender: sender.to_string(),
                recipient: recipient.clone(),
                file_chunk: block[..filled].to_vec(),
            },
        )
        .await?;
        on_progress(transfer.record(filled));

        if filled < block.len() {
            break;
        }
    }

    push(
        outbound,
        Message::FileComplete {
            sender: sender.to_string(),
            recipient: recipient.clone(),
            file_name: file_name.clone(),
        },
    )
    .await?;
    info!(%file_name, %recipient, bytes = transfer.sent(), "file sent");
    Ok(transfer.sent())
}

async fn push(outbound: &mpsc::Sender<Message>, message: Message) -> Result<(), TransferError> {
    outbound
        .send(message)
        .await
        .map_err(|_| TransferError::ConnectionClosed)
}

/// Reads until `block` is full or the source is exhausted.
async fn fill_block<R>(reader: &mut R, block: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < block.len() {
        let read = reader.read(&mut block[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
