// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Bounded, non-blocking fan-out of a byte stream.
//!
//! A single producer calls [`Broadcaster::write`]; every subscriber has its own
//! bounded queue. When a queue is full the chunk is dropped for that
//! subscriber only (drop-newest), so chunks already queued keep their order and
//! a stalled viewer never slows the producer or the other viewers. The last
//! `backlog_limit` bytes are kept for viewers that attach late.

use bytes::Bytes;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

struct Shared {
    backlog_limit: usize,
    queue_capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    backlog: VecDeque<u8>,
    subscribers: HashMap<String, Slot>,
    next_token: u64,
}

struct Slot {
    token: u64,
    tx: mpsc::Sender<Bytes>,
}

impl Broadcaster {
    pub fn new(backlog_limit: usize, queue_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                backlog_limit,
                queue_capacity: queue_capacity.max(1),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Append to the backlog and offer the chunk to every subscriber.
    /// Returns how many subscribers accepted it.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let chunk = Bytes::copy_from_slice(data);
        let mut inner = self.shared.lock();
        inner.push_backlog(data, self.shared.backlog_limit);

        let mut delivered = 0;
        inner
            .subscribers
            .retain(|id, slot| match slot.tx.try_send(chunk.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => {
                    debug!("subscriber {id} went away, removing");
                    false
                }
            });
        delivered
    }

    /// Register a queue for `id`. An existing subscriber with the same id is
    /// replaced and its stream ends.
    pub fn subscribe(&self, id: impl Into<String>) -> Subscription {
        let mut inner = self.shared.lock();
        self.register(&mut inner, id.into())
    }

    /// Snapshot the backlog and subscribe in one step, so no chunk written in
    /// between is lost or seen twice.
    pub fn subscribe_with_backlog(&self, id: impl Into<String>) -> (Bytes, Subscription) {
        let mut inner = self.shared.lock();
        let backlog = Bytes::from(Vec::from(inner.backlog.clone()));
        let subscription = self.register(&mut inner, id.into());
        (backlog, subscription)
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.shared.lock().subscribers.remove(id).is_some()
    }

    pub fn backlog(&self) -> Bytes {
        Bytes::from(Vec::from(self.shared.lock().backlog.clone()))
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    fn register(&self, inner: &mut Inner, id: String) -> Subscription {
        let (tx, rx) = mpsc::channel(self.shared.queue_capacity);
        let token = inner.next_token;
        inner.next_token += 1;
        inner.subscribers.insert(id.clone(), Slot { token, tx });
        Subscription {
            id,
            token,
            rx,
            owner: Arc::downgrade(&self.shared),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn push_backlog(&mut self, data: &[u8], limit: usize) {
        if data.len() >= limit {
            self.backlog.clear();
            self.backlog.extend(&data[data.len() - limit..]);
            return;
        }
        self.backlog.extend(data);
        let excess = self.backlog.len().saturating_sub(limit);
        self.backlog.drain(..excess);
    }
}

/// Read side of one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: String,
    token: u64,
    rx: mpsc::Receiver<Bytes>,
    owner: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next chunk, or `None` once the subscription was replaced or removed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Copy chunks into `writer` until the stream ends or a write fails. The
    /// subscription is released either way.
    pub async fn forward_to<W>(mut self, mut writer: W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(chunk) = self.rx.recv().await {
            if let Err(e) = writer.write_all(&chunk).await {
                debug!("subscriber {} write failed: {e}", self.id);
                return Err(e);
            }
            writer.flush().await?;
        }
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(shared) = self.owner.upgrade() else {
            return;
        };
        let mut inner = shared.lock();
        if inner
            .subscribers
            .get(&self.id)
            .is_some_and(|slot| slot.token == self.token)
        {
            inner.subscribers.remove(&self.id);
        }
    }
}
