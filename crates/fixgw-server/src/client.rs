//! Async netfix client.
//!
//! One [`NetfixClient`] owns one TCP connection. A background task reads
//! every line from the server: command replies are routed to the request
//! currently waiting for them, value updates for subscribed keys are
//! delivered on a separate channel returned by [`NetfixClient::connect`].
//!
//! Requests are serialized; each waits at most the configured response
//! timeout for a matching reply.

use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use fixgw_core::{DataType, FlagKind, Flags, ItemDefinition};
use fixgw_protocol::{
    decode_flags, decode_reply, decode_value_update, encode_command, encode_value_write,
    CodecError, Command, Reply, ValueUpdate,
};

use crate::error::ClientError;

/// A value as reported by a remote server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteValue {
    pub value: String,
    /// Absent for aux values.
    pub flags: Option<Flags>,
}

impl RemoteValue {
    fn parse(body: &str) -> Self {
        match body.rsplit_once(';') {
            Some((value, field)) => match decode_flags(field) {
                Ok(flags) => Self {
                    value: value.to_string(),
                    flags: Some(flags),
                },
                Err(_) => Self {
                    value: body.to_string(),
                    flags: None,
                },
            },
            None => Self {
                value: body.to_string(),
                flags: None,
            },
        }
    }
}

struct Channel {
    writer: OwnedWriteHalf,
    replies: UnboundedReceiver<Reply>,
}

pub struct NetfixClient {
    peer: SocketAddr,
    response_timeout: Duration,
    channel: Mutex<Channel>,
    reader: JoinHandle<()>,
}

impl NetfixClient {
    /// Connect to a netfix server.
    ///
    /// The returned receiver yields value updates pushed by the server for
    /// subscribed keys; it closes when the connection does.
    pub async fn connect(
        addr: &str,
        response_timeout: Duration,
    ) -> Result<(Self, UnboundedReceiver<ValueUpdate>), ClientError> {
        let stream = timeout(response_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ClientError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {addr} timed out"),
                ))
            })??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }
        let peer = stream.peer_addr()?;

        let (read_half, writer) = stream.into_split();
        let (reply_tx, replies) = mpsc::unbounded_channel();
        let (update_tx, updates) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, peer, reply_tx, update_tx));

        debug!("Connected to {}", peer);
        let client = Self {
            peer,
            response_timeout,
            channel: Mutex::new(Channel { writer, replies }),
            reader,
        };
        Ok((client, updates))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the server closed the connection.
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// Read a key or `key.aux` address.
    pub async fn read(&self, address: &str) -> Result<RemoteValue, ClientError> {
        let reply = self
            .request(Command::Read {
                key: address.to_string(),
            })
            .await?;
        Ok(RemoteValue::parse(body(&reply)))
    }

    /// Authoritative write; returns the value as stored by the server.
    pub async fn write(
        &self,
        address: &str,
        value: impl Display,
    ) -> Result<RemoteValue, ClientError> {
        let reply = self
            .request(Command::Write {
                key: address.to_string(),
                value: Some(value.to_string()),
            })
            .await?;
        Ok(RemoteValue::parse(body(&reply)))
    }

    pub async fn subscribe(&self, address: &str) -> Result<(), ClientError> {
        self.request(Command::Subscribe {
            key: address.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn unsubscribe(&self, address: &str) -> Result<(), ClientError> {
        self.request(Command::Unsubscribe {
            key: address.to_string(),
        })
        .await
        .map(drop)
    }

    /// Fetch an item's description.
    pub async fn describe(&self, key: &str) -> Result<ItemDefinition, ClientError> {
        let reply = self
            .request(Command::Query {
                key: key.to_string(),
            })
            .await?;
        parse_definition(&reply.key, body(&reply)).map_err(ClientError::Malformed)
    }

    pub async fn set_flag(&self, key: &str, flag: FlagKind, on: bool) -> Result<(), ClientError> {
        self.request(Command::SetFlag {
            key: key.to_string(),
            flag: flag.letter().to_string(),
            setting: if on { "1" } else { "0" }.to_string(),
        })
        .await
        .map(drop)
    }

    /// List every key, following `@l` pagination.
    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        let replies = self
            .exchange(&Command::List, |replies| {
                replies.last().map_or(false, |r| {
                    let (total, offset) = list_progress(r);
                    offset >= total
                })
            })
            .await?;

        let mut keys = Vec::new();
        for reply in &replies {
            // Body is "<offset>;<comma list>".
            let list = body(reply).split_once(';').map_or("", |(_, list)| list);
            keys.extend(list.split(',').filter(|k| !k.is_empty()).map(String::from));
        }
        Ok(keys)
    }

    /// Fetch the `@xstatus` document.
    pub async fn status(&self) -> Result<serde_json::Value, ClientError> {
        let reply = self.request(Command::Status).await?;
        serde_json::from_str(body(&reply))
            .map_err(|e| ClientError::Malformed(CodecError::Malformed(e.to_string())))
    }

    /// Ask the server to shut down.
    pub async fn kill(&self) -> Result<(), ClientError> {
        self.request(Command::Kill).await.map(drop)
    }

    /// Send a fire-and-forget value update.
    pub async fn send_update(&self, update: &ValueUpdate) -> Result<(), ClientError> {
        let line = encode_value_write(update);
        let mut channel = self.channel.lock().await;
        channel
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(ClientError::SendFailed)
    }

    /// Send a command and wait for its reply, turning `!NNN` replies into
    /// [`ClientError::Protocol`].
    pub async fn request(&self, command: Command) -> Result<Reply, ClientError> {
        let mut replies = self.exchange(&command, |replies| !replies.is_empty()).await?;
        let reply = replies.pop().ok_or(ClientError::NotConnected)?;
        match reply.body {
            Err(code) => Err(ClientError::Protocol {
                command: request_text(&command),
                code,
            }),
            Ok(_) => Ok(reply),
        }
    }

    /// Send one command and collect matching replies until `complete`
    /// returns true. Unmatched replies (late answers to timed-out requests)
    /// are discarded.
    async fn exchange(
        &self,
        command: &Command,
        complete: impl Fn(&[Reply]) -> bool,
    ) -> Result<Vec<Reply>, ClientError> {
        let line = encode_command(command);
        let mut channel = self.channel.lock().await;

        while let Ok(stale) = channel.replies.try_recv() {
            debug!("Discarding stale reply {:?}", stale);
        }

        channel
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(ClientError::SendFailed)?;

        let deadline = Instant::now() + self.response_timeout;
        let mut collected = Vec::new();
        loop {
            match timeout_at(deadline, channel.replies.recv()).await {
                Err(_) => {
                    return Err(ClientError::ResponseTimeout {
                        command: request_text(command),
                    })
                }
                Ok(None) => return Err(ClientError::NotConnected),
                Ok(Some(reply)) if reply_matches(command, &reply) => {
                    let failed = reply.body.is_err();
                    collected.push(reply);
                    if failed || complete(&collected) {
                        return Ok(collected);
                    }
                }
                Ok(Some(reply)) => debug!("Discarding unmatched reply {:?}", reply),
            }
        }
    }
}

impl Drop for NetfixClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    peer: SocketAddr,
    replies: UnboundedSender<Reply>,
    updates: UnboundedSender<ValueUpdate>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Server {} closed the connection", peer);
                break;
            }
            Err(e) => {
                warn!("Read error from {}: {}", peer, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        if line.starts_with('@') {
            match decode_reply(&line) {
                Ok(reply) => {
                    let _ = replies.send(reply);
                }
                Err(e) => warn!("Bad reply from {}: {}", peer, e),
            }
        } else {
            match decode_value_update(&line) {
                Ok(update) => {
                    let _ = updates.send(update);
                }
                Err(e) => warn!("Bad update from {}: {}", peer, e),
            }
        }
    }
}

fn body(reply: &Reply) -> &str {
    reply.body.as_deref().unwrap_or_default()
}

fn request_text(command: &Command) -> String {
    encode_command(command).trim_end().to_string()
}

fn reply_matches(command: &Command, reply: &Reply) -> bool {
    if reply.letter != command.letter() {
        return false;
    }
    match command {
        Command::List => true,
        Command::Read { key }
        | Command::Write { key, .. }
        | Command::Subscribe { key }
        | Command::Unsubscribe { key }
        | Command::Query { key }
        | Command::SetFlag { key, .. } => &reply.key == key,
        Command::Status => reply.key == "status",
        Command::Kill => reply.key == "kill",
        Command::Extended(payload) => &reply.key == payload,
        Command::Unknown { payload, .. } => payload.starts_with(reply.key.as_str()),
    }
}

/// `(total, offset)` of an `@l` reply; the total is carried in the key slot.
fn list_progress(reply: &Reply) -> (usize, usize) {
    let total = reply.key.parse().unwrap_or(0);
    let offset = body(reply)
        .split(';')
        .next()
        .and_then(|o| o.parse().ok())
        .unwrap_or(0);
    (total, offset)
}

fn parse_definition(key: &str, body: &str) -> Result<ItemDefinition, CodecError> {
    let malformed = || CodecError::Malformed(format!("{key};{body}"));
    let fields: Vec<&str> = body.split(';').collect();
    let [description, data_type, min, max, units, tol, aux] = fields.as_slice() else {
        return Err(malformed());
    };

    let bound = |s: &str| -> Result<Option<f64>, CodecError> {
        if s.is_empty() {
            Ok(None)
        } else {
            s.parse().map(Some).map_err(|_| malformed())
        }
    };
    let data_type: DataType = data_type.parse().map_err(|_| malformed())?;

    Ok(ItemDefinition {
        key: key.to_string(),
        data_type,
        description: description.to_string(),
        min: bound(*min)?,
        max: bound(*max)?,
        units: units.to_string(),
        tol: tol.parse().map_err(|_| malformed())?,
        initial: None,
        aux: aux
            .split(',')
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect(),
    })
}
