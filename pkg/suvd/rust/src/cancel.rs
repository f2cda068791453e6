// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Single-slot stop handoff between callers and a supervision task.
//!
//! Each launch arms a fresh one-slot channel, so a signal meant for an earlier
//! run can never stop a later one. Signalling never blocks the caller: when the
//! slot is already occupied a detached task keeps trying for a bounded time.
//! A signal that is never consumed is recovered at the supervision task's next
//! check point (exit, retry wait, relaunch).

use log::{debug, warn};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the current run.
    Delivered,
    /// The slot was busy; a bounded retry was scheduled.
    Deferred,
    /// Nothing is armed, or the run already finished.
    NoListener,
}

#[derive(Default)]
pub struct CancelSlot {
    tx: Mutex<Option<mpsc::Sender<()>>>,
}

pub struct CancelReceiver {
    rx: mpsc::Receiver<()>,
}

impl CancelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot with a fresh channel and return its receiving end.
    pub fn arm(&self) -> CancelReceiver {
        let (tx, rx) = mpsc::channel(1);
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        CancelReceiver { rx }
    }

    pub fn signal(&self, wait: Duration) -> Delivery {
        let Some(tx) = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return Delivery::NoListener;
        };

        match tx.try_send(()) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Closed(())) => Delivery::NoListener,
            Err(TrySendError::Full(())) => {
                tokio::spawn(async move {
                    match tokio::time::timeout(wait, tx.send(())).await {
                        Ok(Ok(())) => debug!("deferred stop signal delivered"),
                        Ok(Err(_)) => debug!("run finished before deferred stop signal"),
                        Err(_) => warn!("stop signal not accepted within {wait:?}, giving up"),
                    }
                });
                Delivery::Deferred
            }
        }
    }
}

impl CancelReceiver {
    pub async fn recv(&mut self) {
        // A dropped sender means the slot was re-armed; that is never a stop.
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    /// Consume a pending signal without waiting.
    pub fn take_pending(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}
