//! In-memory change feed
//!
//! Tests script what each drain returns. The feed is a cheap handle; clones
//! share state, so a test can keep one handle while the engine owns another.

use super::{ChangeFeed, ChangeNotification};
use crate::error::{ReplicationError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct State {
    batches: VecDeque<Vec<ChangeNotification>>,
    pending: Vec<ChangeNotification>,
    connected: bool,
    connects: usize,
    disconnects: usize,
    drains: usize,
    fail_connect: bool,
}

/// Scripted [`ChangeFeed`].
///
/// Each [`drain_pending`](ChangeFeed::drain_pending) returns the next
/// scripted batch plus anything [`push`](Self::push)ed since the previous
/// drain. With [`cancel_when_exhausted`](Self::cancel_when_exhausted) the
/// given token is cancelled on the first drain that finds no batches left,
/// which lets a test run the loop to a deterministic end.
#[derive(Debug, Clone, Default)]
pub struct MemoryChangeFeed {
    state: Arc<Mutex<State>>,
    exhausted: Option<CancellationToken>,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a batch for a later drain.
    pub fn with_batch(self, batch: Vec<ChangeNotification>) -> Self {
        self.state.lock().batches.push_back(batch);
        self
    }

    pub fn cancel_when_exhausted(mut self, token: CancellationToken) -> Self {
        self.exhausted = Some(token);
        self
    }

    /// Make the next `connect()` fail.
    pub fn fail_next_connect(&self) {
        self.state.lock().fail_connect = true;
    }

    /// Buffer a notification for the next drain.
    pub fn push(&self, notification: ChangeNotification) {
        self.state.lock().pending.push(notification);
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn drains(&self) -> usize {
        self.state.lock().drains
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_connect) {
            return Err(ReplicationError::feed("scripted connect failure"));
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    fn drain_pending(&mut self) -> Vec<ChangeNotification> {
        let mut state = self.state.lock();
        state.drains += 1;

        let mut drained = std::mem::take(&mut state.pending);
        match state.batches.pop_front() {
            Some(batch) => drained.extend(batch),
            None => {
                if let Some(token) = &self.exhausted {
                    token.cancel();
                }
            }
        }
        drained
    }

    fn has_pending(&self) -> bool {
        let state = self.state.lock();
        !state.pending.is_empty() || !state.batches.is_empty()
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }
}
