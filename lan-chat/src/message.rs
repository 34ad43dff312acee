use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{error::ProtocolError, transfer::CHUNK_SIZE};

/// Version stamped on every frame. Frames carrying any other value are rejected.
pub const PROTOCOL_VERSION: u16 = 1;

/// Recipient sentinel that fans a message out to every registered connection.
pub const BROADCAST: &str = "ALL";

/// Identity used for messages the server originates itself.
pub const SERVER_IDENTITY: &str = "Server";

/// Longest line accepted from a peer: a full base64 chunk plus room for the
/// envelope fields.
pub const MAX_FRAME_LEN: usize = 4 * CHUNK_SIZE.div_ceil(3) + 8 * 1024;

const LINE_ENDINGS: &[u8] = b"\n\r";

/// Addressing for messages that can go either to one identity or to everyone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    All,
    User(String),
}

impl Recipient {
    pub fn user(identity: impl Into<String>) -> Self {
        Recipient::User(identity.into())
    }

    /// Parses user input where the sentinel is accepted in any case.
    pub fn parse_loose(value: &str) -> Self {
        if value.eq_ignore_ascii_case(BROADCAST) {
            Recipient::All
        } else {
            Recipient::User(value.to_string())
        }
    }
}

impl From<String> for Recipient {
    fn from(value: String) -> Self {
        if value == BROADCAST {
            Recipient::All
        } else {
            Recipient::User(value)
        }
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        match value {
            Recipient::All => BROADCAST.to_string(),
            Recipient::User(identity) => identity,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::All => f.write_str(BROADCAST),
            Recipient::User(identity) => f.write_str(identity),
        }
    }
}

/// Every event that crosses a connection, in either direction.
///
/// Each variant only carries the fields its tag defines, so a chunk can never
/// show up with a text payload and a chat line can never carry file bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    Connect {
        sender: String,
    },
    Disconnect {
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    UserListUpdate {
        sender: String,
        recipient: Recipient,
        users: Vec<String>,
    },
    BroadcastChat {
        sender: String,
        recipient: Recipient,
        content: String,
    },
    PrivateChat {
        sender: String,
        recipient: String,
        content: String,
    },
    Buzz {
        sender: String,
        recipient: Recipient,
    },
    TypingStart {
        sender: String,
        recipient: Recipient,
    },
    TypingStop {
        sender: String,
        recipient: Recipient,
    },
    FileRequest {
        sender: String,
        recipient: Recipient,
        #[serde(rename = "content")]
        file_name: String,
        file_size: u64,
    },
    FileChunk {
        sender: String,
        recipient: Recipient,
        #[serde(with = "chunk_bytes")]
        file_chunk: Vec<u8>,
    },
    FileComplete {
        sender: String,
        recipient: Recipient,
        #[serde(rename = "content")]
        file_name: String,
    },
    FileReject {
        sender: String,
        recipient: Recipient,
        #[serde(rename = "content")]
        file_name: String,
    },
}

impl Message {
    pub fn sender(&self) -> &str {
        match self {
            Message::Connect { sender }
            | Message::Disconnect { sender, .. }
            | Message::UserListUpdate { sender, .. }
            | Message::BroadcastChat { sender, .. }
            | Message::PrivateChat { sender, .. }
            | Message::Buzz { sender, .. }
            | Message::TypingStart { sender, .. }
            | Message::TypingStop { sender, .. }
            | Message::FileRequest { sender, .. }
            | Message::FileChunk { sender, .. }
            | Message::FileComplete { sender, .. }
            | Message::FileReject { sender, .. } => sender,
        }
    }

    /// Replaces the sender field, used by the server to stamp relayed traffic
    /// with the identity bound to the originating session.
    pub fn with_sender(mut self, identity: &str) -> Self {
        match &mut self {
            Message::Connect { sender }
            | Message::Disconnect { sender, .. }
            | Message::UserListUpdate { sender, .. }
            | Message::BroadcastChat { sender, .. }
            | Message::PrivateChat { sender, .. }
            | Message::Buzz { sender, .. }
            | Message::TypingStart { sender, .. }
            | Message::TypingStop { sender, .. }
            | Message::FileRequest { sender, .. }
            | Message::FileChunk { sender, .. }
            | Message::FileComplete { sender, .. }
            | Message::FileReject { sender, .. } => *sender = identity.to_string(),
        }
        self
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "CONNECT",
            Message::Disconnect { .. } => "DISCONNECT",
            Message::UserListUpdate { .. } => "USER_LIST_UPDATE",
            Message::BroadcastChat { .. } => "BROADCAST_CHAT",
            Message::PrivateChat { .. } => "PRIVATE_CHAT",
            Message::Buzz { .. } => "BUZZ",
            Message::TypingStart { .. } => "TYPING_START",
            Message::TypingStop { .. } => "TYPING_STOP",
            Message::FileRequest { .. } => "FILE_REQUEST",
            Message::FileChunk { .. } => "FILE_CHUNK",
            Message::FileComplete { .. } => "FILE_COMPLETE",
            Message::FileReject { .. } => "FILE_REJECT",
        }
    }

    pub fn server_notice(content: impl Into<String>) -> Self {
        Message::BroadcastChat {
            sender: SERVER_IDENTITY.to_string(),
            recipient: Recipient::All,
            content: content.into(),
        }
    }

    pub fn user_list(users: Vec<String>) -> Self {
        Message::UserListUpdate {
            sender: SERVER_IDENTITY.to_string(),
            recipient: Recipient::All,
            users,
        }
    }
}

#[derive(Serialize)]
struct FrameRef<'a> {
    version: u16,
    #[serde(flatten)]
    message: &'a Message,
}

#[derive(Deserialize)]
struct Frame {
    version: u16,
    #[serde(flatten)]
    message: Message,
}

mod chunk_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

/// Encodes one frame without the trailing delimiter.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let frame = FrameRef {
        version: PROTOCOL_VERSION,
        message,
    };
    Ok(serde_json::to_vec(&frame)?)
}

/// Decodes one frame, checking the version stamp.
pub fn decode(line: &[u8]) -> Result<Message, ProtocolError> {
    let frame: Frame = serde_json::from_slice(line)?;
    if frame.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(frame.version));
    }
    Ok(frame.message)
}

/// Reads frames from a buffered stream.
///
/// The partially received line lives in the reader, not in the `next`
/// future, so `next` can be raced in a `select!` without losing bytes.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
    discarding: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            discarding: false,
        }
    }

    /// Next frame, or `Ok(None)` at a clean end of stream.
    ///
    /// A frame that fails to decode is reported but consumed, so callers may
    /// keep reading after [`ProtocolError::is_recoverable`] errors.
    pub async fn next(&mut self) -> Result<Option<Message>, ProtocolError> {
        next_frame(&mut self.reader, &mut self.buffer, &mut self.discarding).await
    }
}

/// Reads the next frame. `Ok(None)` signals a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut discarding = false;
    next_frame(reader, &mut buffer, &mut discarding).await
}

async fn next_frame<R>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
    discarding: &mut bool,
) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    // Newline framing: base64 keeps chunk payloads free of raw line breaks.
    loop {
        let budget = MAX_FRAME_LEN.saturating_sub(buffer.len()) as u64;
        let read = (&mut *reader)
            .take(budget)
            .read_until(b'\n', buffer)
            .await?;
        let terminated = buffer.last() == Some(&b'\n');

        // Skipping the tail of an oversized line until its newline.
        if *discarding {
            buffer.clear();
            if terminated {
                *discarding = false;
            } else if read == 0 {
                return Ok(None);
            }
            continue;
        }

        if !terminated && buffer.len() >= MAX_FRAME_LEN {
            buffer.clear();
            *discarding = true;
            return Err(ProtocolError::FrameTooLarge(MAX_FRAME_LEN));
        }

        if read == 0 && buffer.is_empty() {
            return Ok(None);
        }

        let line = std::mem::take(buffer);
        let trimmed = trim_line_ending(&line);
        if trimmed.is_empty() {
            if read == 0 {
                return Ok(None);
            }
            continue;
        }

        return decode(trimmed).map(Some);
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|byte| !LINE_ENDINGS.contains(byte))
        .map_or(0, |index| index + 1);
    &line[..end]
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = encode(message)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_file_chunk_with_newline_bytes() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let message = Message::FileChunk {
            sender: "alice".into(),
            recipient: Recipient::user("bob"),
            file_chunk: vec![b'\n', 0, 255, b'\r', 42],
        };

        write_message(&mut writer, &message)
            .await
            .expect("write message");
        let parsed = read_message(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");

        assert_eq!(message, parsed);
    }

    #[test]
    fn wire_format_uses_tags_and_camel_case_fields() {
        let message = Message::FileRequest {
            sender: "alice".into(),
            recipient: Recipient::All,
            file_name: "x.txt".into(),
            file_size: 20,
        };
        let encoded = String::from_utf8(encode(&message).expect("encode")).expect("utf8");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("json");

        assert_eq!(value["version"], 1);
        assert_eq!(value["type"], "FILE_REQUEST");
        assert_eq!(value["recipient"], "ALL");
        assert_eq!(value["content"], "x.txt");
        assert_eq!(value["fileSize"], 20);
    }

    #[test]
    fn decode_accepts_hand_written_frame() {
        let line = r#"{"version":1,"type":"PRIVATE_CHAT","sender":"a","recipient":"b","content":"hi"}"#;
        assert_eq!(
            decode(line.as_bytes()).expect("decode"),
            Message::PrivateChat {
                sender: "a".into(),
                recipient: "b".into(),
                content: "hi".into(),
            }
        );
    }

    #[test]
    fn decode_rejects_other_versions() {
        let line = r#"{"version":7,"type":"CONNECT","sender":"a"}"#;
        assert!(matches!(
            decode(line.as_bytes()),
            Err(ProtocolError::UnsupportedVersion(7))
        ));
    }

    #[tokio::test]
    async fn malformed_frame_does_not_desync_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer
            .write_all(b"{\"version\":1,\"type\":\"NOPE\"}\n")
            .await
            .expect("write garbage");
        write_message(
            &mut writer,
            &Message::Connect {
                sender: "bob".into(),
            },
        )
        .await
        .expect("write connect");

        let first = read_message(&mut reader).await;
        assert!(matches!(first, Err(ref err) if err.is_recoverable()));

        let second = read_message(&mut reader)
            .await
            .expect("read connect")
            .expect("expected message");
        assert_eq!(second.tag(), "CONNECT");
    }

    #[tokio::test]
    async fn oversized_line_is_rejected_and_stream_recovers() {
        let follow_up = Message::Connect {
            sender: "alice".into(),
        };
        let mut input = vec![b'x'; MAX_FRAME_LEN + 100];
        input.push(b'\n');
        input.extend(encode(&follow_up).expect("encode"));
        input.push(b'\n');

        let mut frames = FrameReader::new(tokio::io::BufReader::new(&input[..]));
        let err = frames.next().await.expect_err("oversized line");
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
        assert!(err.is_recoverable());
        assert_eq!(frames.next().await.expect("read"), Some(follow_up));
        assert_eq!(frames.next().await.expect("eof"), None);
    }

    #[tokio::test]
    async fn full_chunk_fits_within_frame_limit() {
        let message = Message::FileChunk {
            sender: "a-rather-long-identity-for-a-lan-user".into(),
            recipient: Recipient::user("another-rather-long-identity"),
            file_chunk: vec![0xAB; CHUNK_SIZE],
        };
        let mut input = encode(&message).expect("encode");
        assert!(input.len() < MAX_FRAME_LEN);
        input.push(b'\n');

        let mut frames = FrameReader::new(tokio::io::BufReader::new(&input[..]));
        assert_eq!(frames.next().await.expect("read"), Some(message));
    }

    #[test]
    fn recipient_sentinel_is_case_sensitive_on_the_wire() {
        assert_eq!(Recipient::from("ALL".to_string()), Recipient::All);
        assert_eq!(Recipient::from("all".to_string()), Recipient::user("all"));
        assert_eq!(Recipient::parse_loose("all"), Recipient::All);
    }

    #[test]
    fn with_sender_overwrites_claimed_identity() {
        let message = Message::Buzz {
            sender: "mallory".into(),
            recipient: Recipient::All,
        }
        .with_sender("alice");
        assert_eq!(message.sender(), "alice");
    }
}
