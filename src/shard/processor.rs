//! Per-shard consumer of replicated messages
//!
//! The processor runs on its own thread for the lifetime of an open shard.
//! It applies messages in delivery order, skips anything older than the
//! shard's applied index, and stops when the connection's channel
//! disconnects. A message it cannot apply means the local replica has
//! diverged from the replicated log: the processor reports a
//! [`ProcessorFailure`] on the shard's failure channel and stops without
//! touching any later message.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error};

use crate::conn::{Message, MessageType};
use crate::shard::handle::ShardShared;
use crate::shard::store::ShardStore;
use crate::shard::{ShardError, ShardResult};

/// Consumer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorState {
    /// Draining the connection
    Running,
    /// Not consuming: never started, connection closed, or failed
    Stopped,
}

/// A message the processor could not apply
#[derive(Debug)]
pub struct ProcessorFailure {
    /// Shard whose processor stopped
    pub shard_id: u64,
    /// Index of the offending message
    pub index: u64,
    /// Raw type byte of the offending message
    pub kind: u8,
    /// Why the message could not be applied
    pub error: ShardError,
}

impl fmt::Display for ProcessorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "apply shard: id={}, idx={}, err={}", self.shard_id, self.index, self.error)
    }
}

impl std::error::Error for ProcessorFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub(crate) struct Processor {
    shared: Arc<ShardShared>,
    store: Arc<ShardStore>,
    messages: Receiver<Message>,
    failures: Sender<ProcessorFailure>,
}

impl Processor {
    pub(crate) fn new(
        shared: Arc<ShardShared>,
        store: Arc<ShardStore>,
        messages: Receiver<Message>,
        failures: Sender<ProcessorFailure>,
    ) -> Self {
        Self {
            shared,
            store,
            messages,
            failures,
        }
    }

    /// Start the consumer thread. The shard reports `Running` from here on.
    pub(crate) fn spawn(self, thread_prefix: &str) -> io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        shared.set_running(true);

        thread::Builder::new()
            .name(format!("{}-{}", thread_prefix, shared.id))
            .spawn(move || self.run())
            .inspect_err(|_| shared.set_running(false))
    }

    fn run(self) {
        let shard_id = self.shared.id;
        debug!(shard_id, index = self.shared.index(), "processor started");

        while let Ok(message) = self.messages.recv() {
            let (index, kind) = (message.index, message.kind);
            if let Err(error) = self.apply(message) {
                error!(shard_id, index, %error, "cannot apply replicated message, stopping processor");
                // The shard keeps a receiver for as long as it exists.
                let _ = self.failures.send(ProcessorFailure {
                    shard_id,
                    index,
                    kind,
                    error,
                });
                break;
            }
        }

        self.shared.set_running(false);
        debug!(shard_id, index = self.shared.index(), "processor stopped");
    }

    fn apply(&self, message: Message) -> ShardResult<()> {
        let current = self.shared.index();
        if message.index < current {
            self.shared.metrics.increment_stale();
            debug!(shard_id = self.shared.id, index = message.index, current, "skipping applied message");
            return Ok(());
        }

        match MessageType::try_from(message.kind) {
            Ok(MessageType::WriteRawSeries) => {
                self.shared.write_series(&self.store, message.index, &message.data)?;
            }
            Err(kind) => return Err(ShardError::UnknownMessageType(kind)),
        }

        self.shared.advance(message.index);
        Ok(())
    }
}
