use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::SessionHandle;

/// Errors for queue reordering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Handle not in queue: {0}")]
    UnknownHandle(SessionHandle),
}

/// Torrent priority order. Index 0 runs first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOrder(Vec<SessionHandle>);

impl QueueOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[SessionHandle] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.0.contains(&handle)
    }

    pub fn position(&self, handle: SessionHandle) -> Option<usize> {
        self.0.iter().position(|h| *h == handle)
    }

    /// Append `handle` unless it is already queued. Returns whether it was added.
    pub fn push_back(&mut self, handle: SessionHandle) -> bool {
        if self.contains(handle) {
            return false;
        }
        self.0.push(handle);
        true
    }

    /// Drop `handle` from the queue. Returns whether it was present.
    pub fn remove(&mut self, handle: SessionHandle) -> bool {
        match self.position(handle) {
            Some(index) => {
                self.0.remove(index);
                true
            }
            None => false,
        }
    }

    /// Swap `handle` with the one ahead of it. No-op at the top.
    pub fn move_up(&mut self, handle: SessionHandle) -> Result<bool, QueueError> {
        let index = self.index_of(handle)?;
        if index == 0 {
            return Ok(false);
        }
        self.0.swap(index, index - 1);
        Ok(true)
    }

    /// Swap `handle` with the one behind it. No-op at the bottom.
    pub fn move_down(&mut self, handle: SessionHandle) -> Result<bool, QueueError> {
        let index = self.index_of(handle)?;
        if index + 1 == self.0.len() {
            return Ok(false);
        }
        self.0.swap(index, index + 1);
        Ok(true)
    }

    /// Move `handle` to index 0, keeping everyone else's relative order.
    pub fn move_to_top(&mut self, handle: SessionHandle) -> Result<bool, QueueError> {
        let index = self.index_of(handle)?;
        if index == 0 {
            return Ok(false);
        }
        self.0[..=index].rotate_right(1);
        Ok(true)
    }

    /// Move `handle` to the end, keeping everyone else's relative order.
    pub fn move_to_bottom(&mut self, handle: SessionHandle) -> Result<bool, QueueError> {
        let index = self.index_of(handle)?;
        if index + 1 == self.0.len() {
            return Ok(false);
        }
        self.0[index..].rotate_left(1);
        Ok(true)
    }

    fn index_of(&self, handle: SessionHandle) -> Result<usize, QueueError> {
        self.position(handle)
            .ok_or(QueueError::UnknownHandle(handle))
    }
}

impl FromIterator<SessionHandle> for QueueOrder {
    fn from_iter<I: IntoIterator<Item = SessionHandle>>(iter: I) -> Self {
        let mut order = Self::new();
        for handle in iter {
            order.push_back(handle);
        }
        order
    }
}
