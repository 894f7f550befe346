//! Netfix frame types.
//!
//! This module defines every line exchanged over a netfix connection:
//! - Client → Server: value updates and `@` commands
//! - Server → Client: replies to commands and subscription value updates
//!
//! Frames are single lines of ASCII terminated by `\n`.

use fixgw_core::Flags;

/// A plain value update, `KEY;VALUE;FLAGS` or `KEY;VALUE`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub key: String,
    /// The value as text; converted by the store on write.
    pub value: String,
    /// Quality flags, absent in the two-field form.
    pub flags: Option<Flags>,
}

/// A command frame, `@<letter><payload>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `@l` - list all keys.
    List,
    /// `@r<key>` - read a value.
    Read { key: String },
    /// `@w<key>;<value>` - authoritative write. `value` is `None` when the
    /// `;<value>` part is missing.
    Write { key: String, value: Option<String> },
    /// `@s<key>` - subscribe to changes.
    Subscribe { key: String },
    /// `@u<key>` - unsubscribe.
    Unsubscribe { key: String },
    /// `@q<key>` - describe an item.
    Query { key: String },
    /// `@f<key>;<flag>;<0|1>` - set one quality flag. Missing parts are
    /// left empty so the server can reply with the matching error.
    SetFlag {
        key: String,
        flag: String,
        setting: String,
    },
    /// `@xstatus` - status report.
    Status,
    /// `@xkill` - shut the gateway down.
    Kill,
    /// Any other `@x` command.
    Extended(String),
    /// Unrecognised command letter.
    Unknown { letter: char, payload: String },
}

impl Command {
    /// The command letter on the wire.
    pub fn letter(&self) -> char {
        match self {
            Command::List => 'l',
            Command::Read { .. } => 'r',
            Command::Write { .. } => 'w',
            Command::Subscribe { .. } => 's',
            Command::Unsubscribe { .. } => 'u',
            Command::Query { .. } => 'q',
            Command::SetFlag { .. } => 'f',
            Command::Status | Command::Kill | Command::Extended(_) => 'x',
            Command::Unknown { letter, .. } => *letter,
        }
    }
}

/// Any decoded netfix line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Value(ValueUpdate),
    Command(Command),
}

/// Error codes carried in `!NNN` reply suffixes.
///
/// The meaning of `002` depends on the command: a duplicate subscription for
/// `@s`, an unknown flag letter for `@f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// `001` - key not found (or unknown `@x` command).
    KeyNotFound,
    /// `002` - request understood but rejected.
    Rejected,
    /// `003` - missing or malformed value.
    BadValue,
    /// `004` - unknown command.
    UnknownCommand,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::KeyNotFound => 1,
            ErrorCode::Rejected => 2,
            ErrorCode::BadValue => 3,
            ErrorCode::UnknownCommand => 4,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::KeyNotFound),
            2 => Some(ErrorCode::Rejected),
            3 => Some(ErrorCode::BadValue),
            4 => Some(ErrorCode::UnknownCommand),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}", self.code())
    }
}

/// A reply to a command, as seen by a client.
///
/// `@r<key>;<value>;<flags>` decodes to letter `r`, key `<key>` and body
/// `<value>;<flags>`; `@r<key>!001` decodes to the same letter and key with
/// an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub letter: char,
    pub key: String,
    pub body: Result<String, ErrorCode>,
}

impl Reply {
    /// The `;`-separated fields of a successful reply body.
    pub fn fields(&self) -> Vec<&str> {
        match &self.body {
            Ok(body) if !body.is_empty() => body.split(';').collect(),
            _ => Vec::new(),
        }
    }
}
