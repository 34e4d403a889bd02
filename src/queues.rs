//! Unbounded FIFO channels connecting workers and consumers.
//!
//! Every channel carries [`Message`]s so a shutdown can be signalled in-band
//! with [`Message::Stop`]. Senders and receivers share a depth counter that the
//! session reports on; it counts items only, never stop signals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

use crate::errors::{AppError, AppResult};

#[derive(Debug)]
pub enum Message<T> {
    Item(T),
    Stop,
}

/// Outcome of a single receive attempt.
#[derive(Debug, PartialEq)]
pub enum Received<T> {
    Item(T),
    Stop,
    /// Nothing arrived before the deadline (or immediately, for `try_recv`).
    Empty,
    /// Every sender is gone and the buffer is drained.
    Closed,
}

pub fn channel<T>(name: &'static str) -> (Outbox<T>, Inbox<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        Outbox {
            name,
            sender,
            depth: depth.clone(),
        },
        Inbox {
            receiver,
            depth,
        },
    )
}

#[derive(Debug)]
pub struct Outbox<T> {
    name: &'static str,
    sender: UnboundedSender<Message<T>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<T> Outbox<T> {
    pub fn push(&self, item: T) -> AppResult<()> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(Message::Item(item)).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::ChannelClosed(self.name));
        }
        Ok(())
    }

    pub fn stop(&self) -> AppResult<()> {
        self.sender
            .send(Message::Stop)
            .map_err(|_| AppError::ChannelClosed(self.name))
    }

    /// Items pushed but not yet received.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Inbox<T> {
    receiver: UnboundedReceiver<Message<T>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Inbox<T> {
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn try_recv(&mut self) -> Received<T> {
        match self.receiver.try_recv() {
            Ok(message) => self.unwrap_message(message),
            Err(TryRecvError::Empty) => Received::Empty,
            Err(TryRecvError::Disconnected) => Received::Closed,
        }
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Received<T> {
        match timeout(wait, self.receiver.recv()).await {
            Ok(Some(message)) => self.unwrap_message(message),
            Ok(None) => Received::Closed,
            Err(_) => Received::Empty,
        }
    }

    /// Turns this inbox into one that several consumers can poll.
    pub fn shared(self) -> SharedInbox<T> {
        SharedInbox {
            inner: Arc::new(AsyncMutex::new(self)),
        }
    }

    fn unwrap_message(&self, message: Message<T>) -> Received<T> {
        match message {
            Message::Item(item) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Received::Item(item)
            }
            Message::Stop => Received::Stop,
        }
    }
}

/// Multi-consumer view of an [`Inbox`]; each item goes to exactly one caller.
#[derive(Debug)]
pub struct SharedInbox<T> {
    inner: Arc<AsyncMutex<Inbox<T>>>,
}

impl<T> Clone for SharedInbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> SharedInbox<T> {
    /// Waits up to `wait` for the lock and an item together.
    pub async fn recv_timeout(&self, wait: Duration) -> Received<T> {
        let attempt = async {
            let mut inbox = self.inner.lock().await;
            let message = inbox.receiver.recv().await;
            message.map(|message| inbox.unwrap_message(message))
        };
        match timeout(wait, attempt).await {
            Ok(Some(received)) => received,
            Ok(None) => Received::Closed,
            Err(_) => Received::Empty,
        }
    }

    pub async fn depth(&self) -> usize {
        self.inner.lock().await.depth()
    }

    /// Drops everything queued so far, stop signals included, and returns the
    /// number of items dropped. Items pushed afterwards are delivered as usual.
    pub async fn discard_queued(&self) -> usize {
        let mut inbox = self.inner.lock().await;
        let mut discarded = 0;
        loop {
            match inbox.try_recv() {
                Received::Item(_) => discarded += 1,
                Received::Stop => {}
                Received::Empty | Received::Closed => break,
            }
        }
        discarded
    }
}
