//! Broker connection interface
//!
//! A shard consumes a totally ordered stream of replicated messages from a
//! [`MessagingConn`]. The transport behind it (delivery, retries, reconnects)
//! belongs to the broker client; this module only defines the contract a
//! shard relies on, plus [`LocalConn`], an in-process channel-backed
//! connection for embedding and tests.

use std::fmt;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;

/// Errors reported by a broker connection
#[derive(Error, Debug)]
pub enum ConnError {
    /// The connection has been shut down
    #[error("connection closed")]
    Closed,

    /// The broker could not be reached or refused the request
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Message types a shard understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// An encoded write batch, see [`crate::codec`]
    WriteRawSeries = 0x80,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Self::WriteRawSeries),
            other => Err(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind as u8
    }
}

/// A replicated message
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned replication index
    pub index: u64,
    /// Raw message type byte
    pub kind: u8,
    /// Message payload
    pub data: Vec<u8>,
}

impl Message {
    /// Create a write-batch message
    pub fn write_raw_series(index: u64, batch: Vec<u8>) -> Self {
        Self {
            index,
            kind: MessageType::WriteRawSeries.into(),
            data: batch,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Streaming connection to the broker for one shard
pub trait MessagingConn: Send + Sync {
    /// Position the connection to deliver messages at or after `index`.
    /// `from_start` asks the broker to replay from that position rather than
    /// only delivering new messages.
    fn open(&self, index: u64, from_start: bool) -> Result<(), ConnError>;

    /// Channel of delivered messages. Disconnects when the connection shuts down.
    fn messages(&self) -> Receiver<Message>;

    /// Shut the connection down, disconnecting the message channel.
    fn close(&self) -> Result<(), ConnError>;
}

/// In-process connection backed by an unbounded channel
///
/// Messages handed to [`LocalConn::publish`] are delivered in order. Closing
/// drops the sending half, so a consumer drains what is buffered and then
/// observes the disconnect.
pub struct LocalConn {
    sender: Mutex<Option<Sender<Message>>>,
    receiver: Receiver<Message>,
    position: Mutex<Option<(u64, bool)>>,
    refuse_open: Option<String>,
}

impl LocalConn {
    /// Create an open, unpositioned connection
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            position: Mutex::new(None),
            refuse_open: None,
        }
    }

    /// Create a connection whose `open` always fails with `reason`
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            refuse_open: Some(reason.into()),
            ..Self::new()
        }
    }

    /// Deliver a message to the consumer
    pub fn publish(&self, message: Message) -> Result<(), ConnError> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(message).map_err(|_| ConnError::Closed),
            None => Err(ConnError::Closed),
        }
    }

    /// The `(index, from_start)` pair the last successful `open` asked for
    pub fn opened_at(&self) -> Option<(u64, bool)> {
        *self.position.lock()
    }

    /// Check if the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Default for LocalConn {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingConn for LocalConn {
    fn open(&self, index: u64, from_start: bool) -> Result<(), ConnError> {
        if let Some(reason) = &self.refuse_open {
            return Err(ConnError::Unavailable(reason.clone()));
        }
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        *self.position.lock() = Some((index, from_start));
        Ok(())
    }

    fn messages(&self) -> Receiver<Message> {
        self.receiver.clone()
    }

    fn close(&self) -> Result<(), ConnError> {
        self.sender.lock().take();
        Ok(())
    }
}
