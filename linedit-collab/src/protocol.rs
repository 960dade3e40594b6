//! Wire protocol for line-level document synchronization.
//!
//! A frame is a `(command, args, body)` triple. Three encodings are accepted:
//!
//! ```text
//! JSON (text message, preferred)
//!   {"command":"FILE_UPDATE","args":["notes.txt","3"],"body":"hello"}
//!
//! Legacy (text message, compatibility)
//!   FILE_UPDATE:notes.txt:3\nhello
//!   └──────── header ──────┘└ body (verbatim to end of message)
//!
//! Binary (binary message)
//!   bincode-encoded Frame
//! ```
//!
//! One WebSocket message always carries exactly one frame, so the transport
//! provides frame boundaries. Text decoding tries JSON first and falls back to
//! the legacy parser; only a frame that neither parser understands is an error.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Claim a username
    Login,
    /// Presence snapshot (server → client)
    UserList,
    /// Create a file if absent
    FileCreate,
    /// Known documents (server → client; a client may also request it)
    FileList,
    /// Request the full content of a file
    FileJoin,
    /// Upsert a single line
    FileUpdate,
    /// Authoritative full content push (server → client)
    FileSync,
    /// Graceful disconnect
    Quit,
    /// Caller-only failure notice
    Error,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::Login,
        Command::UserList,
        Command::FileCreate,
        Command::FileList,
        Command::FileJoin,
        Command::FileUpdate,
        Command::FileSync,
        Command::Quit,
        Command::Error,
    ];

    /// The wire token for this command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Login => "LOGIN",
            Command::UserList => "USER_LIST",
            Command::FileCreate => "FILE_CREATE",
            Command::FileList => "FILE_LIST",
            Command::FileJoin => "FILE_JOIN",
            Command::FileUpdate => "FILE_UPDATE",
            Command::FileSync => "FILE_SYNC",
            Command::Quit => "QUIT",
            Command::Error => "ERROR",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == token)
            .ok_or_else(|| ProtocolError::UnknownCommand(token.to_string()))
    }
}

/// Encoding used on a connection.
///
/// The server answers each peer in the encoding that peer last used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum WireFormat {
    #[default]
    Json = 0,
    Legacy = 1,
    Binary = 2,
}

impl WireFormat {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => WireFormat::Legacy,
            2 => WireFormat::Binary,
            _ => WireFormat::Json,
        }
    }

    /// Best guess for a text message that failed to decode, so the `ERROR`
    /// reply is readable by the sender.
    pub fn sniff_text(raw: &str) -> Self {
        if raw.trim_start().starts_with('{') {
            WireFormat::Json
        } else {
            WireFormat::Legacy
        }
    }
}

/// An encoded frame, ready to be wrapped in a WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Text(String),
    Binary(Vec<u8>),
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub command: Command,
    #[serde(default)]
    pub args: Vec<String>,
    /// Free-form text (file content or error message). May contain newlines.
    #[serde(default)]
    pub body: Option<String>,
}

impl Frame {
    pub fn new(command: Command, args: Vec<String>, body: Option<String>) -> Self {
        Self { command, args, body }
    }

    pub fn login(username: impl Into<String>) -> Self {
        Self::new(Command::Login, vec![username.into()], None)
    }

    pub fn user_list(usernames: Vec<String>) -> Self {
        Self::new(Command::UserList, usernames, None)
    }

    pub fn file_create(filename: impl Into<String>) -> Self {
        Self::new(Command::FileCreate, vec![filename.into()], None)
    }

    pub fn file_list(filenames: Vec<String>) -> Self {
        Self::new(Command::FileList, filenames, None)
    }

    pub fn file_join(filename: impl Into<String>) -> Self {
        Self::new(Command::FileJoin, vec![filename.into()], None)
    }

    /// Line numbers are 1-based on the wire.
    pub fn file_update(filename: impl Into<String>, line: usize, text: impl Into<String>) -> Self {
        Self::new(
            Command::FileUpdate,
            vec![filename.into(), line.to_string()],
            Some(text.into()),
        )
    }

    pub fn file_sync(filename: impl Into<String>, lines: &[String]) -> Self {
        Self::new(Command::FileSync, vec![filename.into()], Some(join_lines(lines)))
    }

    pub fn quit(username: impl Into<String>) -> Self {
        Self::new(Command::Quit, vec![username.into()], None)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Command::Error, Vec::new(), Some(message.into()))
    }

    /// Encode in the given wire format.
    pub fn encode(&self, format: WireFormat) -> Result<Encoded, ProtocolError> {
        match format {
            WireFormat::Json => self.encode_json().map(Encoded::Text),
            WireFormat::Legacy => Ok(Encoded::Text(self.encode_legacy())),
            WireFormat::Binary => self.encode_binary().map(Encoded::Binary),
        }
    }

    pub fn encode_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// `COMMAND:arg1:arg2` header, then `\n` + body when a body is present.
    pub fn encode_legacy(&self) -> String {
        let header = format!("{}:{}", self.command, self.args.join(":"));
        match &self.body {
            Some(body) => format!("{header}\n{body}"),
            None => header,
        }
    }

    pub fn encode_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the legacy delimited form.
    ///
    /// Arguments cannot contain `:` and a header of `COMMAND:` decodes with no
    /// arguments; use the JSON or binary form when that matters.
    pub fn decode_legacy(raw: &str) -> Result<Self, ProtocolError> {
        let (header, body) = match raw.split_once('\n') {
            Some((header, body)) => (header, Some(body.to_string())),
            None => (raw, None),
        };
        let header = header.trim();
        if header.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }

        let (token, rest) = match header.split_once(':') {
            Some((token, rest)) => (token, rest),
            None => (header, ""),
        };
        let command = token.parse::<Command>()?;
        let args = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(':').map(str::to_string).collect()
        };

        Ok(Self { command, args, body })
    }

    /// Decode a text message: JSON first, legacy on failure.
    ///
    /// Returns the format that matched so replies can use it.
    pub fn decode_text(raw: &str) -> Result<(Self, WireFormat), ProtocolError> {
        if let Ok(frame) = Self::decode_json(raw) {
            return Ok((frame, WireFormat::Json));
        }
        Self::decode_legacy(raw).map(|frame| (frame, WireFormat::Legacy))
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    /// Body split back into lines (`FILE_SYNC` payloads).
    pub fn body_lines(&self) -> Vec<String> {
        self.body.as_deref().map(split_lines).unwrap_or_default()
    }
}

/// Newline-join document lines for a `FILE_SYNC` body.
pub fn join_lines(lines: &[String]) -> String {
    lines.join("\n")
}

/// Inverse of [`join_lines`]. An empty body is an empty document.
///
/// `[""]` and `[]` both join to `""`, so a document holding a single empty
/// line reads back as an empty document. Line numbers past the end are
/// padded on the next update, so editors see the same result either way.
pub fn split_lines(body: &str) -> Vec<String> {
    if body.is_empty() {
        return Vec::new();
    }
    body.split('\n').map(str::to_string).collect()
}

/// A client request with its arguments validated for shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Login { username: String },
    FileCreate { filename: String },
    FileJoin { filename: String },
    FileUpdate { filename: String, line: NonZeroUsize, text: String },
    FileList,
    Quit,
}

impl TryFrom<Frame> for Request {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let Frame { command, args, body } = frame;
        let mut args = args.into_iter();
        let mut take = |expected: usize, got: usize| {
            args.next().ok_or(ProtocolError::Arity { command, expected, got })
        };

        match command {
            Command::Login => Ok(Request::Login { username: take(1, 0)? }),
            Command::FileCreate => Ok(Request::FileCreate { filename: take(1, 0)? }),
            Command::FileJoin => Ok(Request::FileJoin { filename: take(1, 0)? }),
            Command::FileUpdate => {
                let filename = take(2, 0)?;
                let raw_line = take(2, 1)?;
                let line = raw_line
                    .trim()
                    .parse::<NonZeroUsize>()
                    .map_err(|_| ProtocolError::InvalidLineNumber(raw_line.clone()))?;
                Ok(Request::FileUpdate {
                    filename,
                    line,
                    text: body.unwrap_or_default(),
                })
            }
            Command::FileList => Ok(Request::FileList),
            Command::Quit => Ok(Request::Quit),
            Command::UserList | Command::FileSync | Command::Error => {
                Err(ProtocolError::UnexpectedCommand(command))
            }
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),
    #[error("Command {0} cannot be sent by a client")]
    UnexpectedCommand(Command),
    #[error("{command} expects {expected} argument(s), got {got}")]
    Arity {
        command: Command,
        expected: usize,
        got: usize,
    },
    #[error("Invalid line number: {0:?} (lines start at 1)")]
    InvalidLineNumber(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
