// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation signal.
///
/// Clones observe the same flag.  `child()` derives a token that is
/// cancelled when either the parent or the child itself is cancelled, but
/// cancelling the child never cancels the parent — this is how an engine
/// run propagates into its stream and action scopes while the stream guard
/// can still revoke a single stream.
///
/// Cancellation is level-triggered and latched: once set it never clears,
/// and `cancelled()` resolves immediately for late awaiters.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    ancestors: Vec<watch::Receiver<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            ancestors: Vec::new(),
        }
    }

    /// Derive a token linked to this one (see type docs).
    pub fn child(&self) -> Self {
        let (tx, rx) = watch::channel(false);
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.rx.clone());
        Self {
            tx: Arc::new(tx),
            rx,
            ancestors,
        }
    }

    /// Request cancellation of this token and all tokens derived from it.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.ancestors.iter().any(|rx| *rx.borrow())
    }

    /// Resolve once cancellation has been requested.  Never resolves
    /// spuriously; pends forever on a token that is never cancelled.
    pub async fn cancelled(&self) {
        let mut waits = Vec::with_capacity(1 + self.ancestors.len());
        for rx in std::iter::once(&self.rx).chain(self.ancestors.iter()) {
            let mut rx = rx.clone();
            waits.push(Box::pin(async move {
                // Err means the sender is gone without ever cancelling;
                // that leg of the race simply never resolves.
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    futures::future::pending::<()>().await;
                }
            }));
        }
        futures::future::select_all(waits).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
