//! Write side of one half of a connection pair.
//!
//! Anything may write to a [`Channel`] at any time. Until the side's protocol
//! handler is installed, writes are queued in order; [`Channel::install`]
//! flushes the queue into the handler's [`Inbox`] and switches to direct
//! delivery. Append and flush share one mutex, so a concurrent write either
//! joins the queue before the flush or lands after every flushed message.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::Message;

enum State {
    Buffering(VecDeque<Message>),
    Installed(mpsc::UnboundedSender<Message>),
    Closed,
}

pub struct Channel {
    side: &'static str,
    state: Mutex<State>,
}

/// Receiving end handed to an installed handler.
///
/// Yields `None` once the channel is closed and everything delivered before
/// the close has been read.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Channel {
    pub fn new(side: &'static str) -> Self {
        Self {
            side,
            state: Mutex::new(State::Buffering(VecDeque::new())),
        }
    }

    pub fn side(&self) -> &'static str {
        self.side
    }

    /// Queue or deliver a message. Fails once the channel is closed; the
    /// message is dropped in that case.
    pub fn write(&self, msg: Message) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Buffering(queue) => {
                queue.push_back(msg);
                Ok(())
            }
            State::Installed(tx) => tx.send(msg).map_err(|_| Error::ChannelClosed),
            State::Closed => Err(Error::ChannelClosed),
        }
    }

    /// Install the side's handler: flush queued messages in order, exactly once.
    pub fn install(&self) -> Result<Inbox> {
        let mut state = self.state.lock().unwrap();
        let queue = match &mut *state {
            State::Buffering(queue) => std::mem::take(queue),
            State::Installed(_) => return Err(Error::AlreadyResolved("channel handler")),
            State::Closed => return Err(Error::ChannelClosed),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let flushed = queue.len();
        for msg in queue {
            // The receiver is still in scope, so this cannot fail.
            let _ = tx.send(msg);
        }
        *state = State::Installed(tx);

        if flushed > 0 {
            tracing::debug!(side = self.side, flushed, "Flushed pending writes");
        }
        Ok(Inbox { rx })
    }

    /// Close the channel. Queued messages that were never delivered are
    /// released and counted; messages already in an inbox stay readable.
    pub fn close(&self) -> usize {
        let previous = std::mem::replace(&mut *self.state.lock().unwrap(), State::Closed);
        match previous {
            State::Buffering(queue) => queue.len(),
            State::Installed(_) | State::Closed => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Closed)
    }

    pub fn is_installed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Installed(_))
    }

    /// Number of writes waiting for installation.
    pub fn pending(&self) -> usize {
        match &*self.state.lock().unwrap() {
            State::Buffering(queue) => queue.len(),
            _ => 0,
        }
    }
}
