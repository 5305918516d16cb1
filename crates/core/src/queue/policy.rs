//! Pure queue decisions: who gets demoted, who runs, who waits.
//!
//! Nothing here talks to the engine. The session layer gathers a
//! `QueueEntry` per handle, asks for a plan, and issues the commands.

use serde::Serialize;

use crate::engine::SessionHandle;

/// What the policy needs to know about one queued torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub handle: SessionHandle,
    /// Index in the queue order. Limits count from here, so a torrent left
    /// out of a plan still holds its slot.
    pub position: usize,
    pub is_paused: bool,
    pub is_seed: bool,
    pub user_paused: bool,
    /// Bytes uploaded in the current engine session.
    pub uploaded_this_session: u64,
    /// Bytes uploaded in earlier sessions.
    pub uploaded_credit: u64,
    /// Verified bytes on disk.
    pub downloaded_total: u64,
    /// Wanted bytes not yet downloaded.
    pub remaining: u64,
    /// Free space in the save directory, when it must fit `remaining`
    /// before resuming (fully allocated torrents only).
    pub free_space: Option<u64>,
}

impl QueueEntry {
    /// Upload/download ratio across sessions, `None` before anything was
    /// downloaded.
    pub fn ratio(&self) -> Option<f64> {
        compute_ratio(
            self.uploaded_this_session,
            self.uploaded_credit,
            self.downloaded_total,
        )
    }
}

/// A command the policy wants issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    Resume(SessionHandle),
    Pause(SessionHandle),
    /// Due to resume but the download no longer fits on disk. The torrent
    /// stays paused and becomes user-paused.
    Hold {
        handle: SessionHandle,
        needed: u64,
        available: u64,
    },
}

impl QueueAction {
    pub fn handle(&self) -> SessionHandle {
        match self {
            QueueAction::Resume(h) | QueueAction::Pause(h) => *h,
            QueueAction::Hold { handle, .. } => *handle,
        }
    }
}

/// What happens to a seed that reached the auto-seed ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatioAction {
    /// Move it to the bottom of the queue.
    MoveToBottom,
    /// Move it to the bottom and user-pause it.
    EndSeeding,
    /// Remove it from the session, keeping its data.
    Remove,
}

impl RatioAction {
    /// From the `auto_end_seeding` and `clear_max_ratio_torrents`
    /// preferences. Removal wins when both are set.
    pub fn select(auto_end_seeding: bool, clear_max_ratio: bool) -> Self {
        match (auto_end_seeding, clear_max_ratio) {
            (_, true) => RatioAction::Remove,
            (true, false) => RatioAction::EndSeeding,
            (false, false) => RatioAction::MoveToBottom,
        }
    }
}

/// Outcome of one queue pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueReport {
    /// Seeds moved to the bottom for reaching the ratio, in their old order.
    pub demoted: Vec<SessionHandle>,
    pub resumed: Vec<SessionHandle>,
    pub paused: Vec<SessionHandle>,
    /// Seeds user-paused for reaching the ratio.
    pub ended_seeding: Vec<SessionHandle>,
    /// Seeds removed for reaching the ratio.
    pub removed: Vec<SessionHandle>,
    /// Torrents kept paused for lack of disk space.
    pub held: Vec<SessionHandle>,
    /// Handles skipped because a state read or command failed.
    pub failed: Vec<SessionHandle>,
}

impl QueueReport {
    /// Whether the pass changed anything.
    pub fn is_noop(&self) -> bool {
        self.demoted.is_empty()
            && self.resumed.is_empty()
            && self.paused.is_empty()
            && self.ended_seeding.is_empty()
            && self.removed.is_empty()
            && self.held.is_empty()
    }
}

/// `(uploaded_this_session + uploaded_credit) / downloaded_total`.
///
/// Undefined (`None`) when nothing has been downloaded.
pub fn compute_ratio(uploaded_this_session: u64, uploaded_credit: u64, downloaded_total: u64) -> Option<f64> {
    if downloaded_total == 0 {
        return None;
    }
    let uploaded = uploaded_this_session.saturating_add(uploaded_credit);
    Some(uploaded as f64 / downloaded_total as f64)
}

/// Seeds whose ratio reached `auto_seed_ratio`, in queue order.
pub fn seeds_to_demote(entries: &[QueueEntry], auto_seed_ratio: f64) -> Vec<SessionHandle> {
    entries
        .iter()
        .filter(|e| e.is_seed)
        .filter(|e| matches!(e.ratio(), Some(r) if r >= auto_seed_ratio))
        .map(|e| e.handle)
        .collect()
}

/// Pause/resume commands for `entries`, in the order given.
///
/// Torrents at a queue position below `max_active` may run (all of them when
/// `None`); user pauses always win. A download that needs more than its
/// `free_space` is held instead of resumed.
pub fn plan_transitions(entries: &[QueueEntry], max_active: Option<usize>) -> Vec<QueueAction> {
    entries
        .iter()
        .filter_map(|entry| {
            let within_limit = max_active.is_none_or(|limit| entry.position < limit);

            if within_limit && entry.is_paused && !entry.user_paused {
                match entry.free_space {
                    Some(available) if !entry.is_seed && entry.remaining > available => {
                        Some(QueueAction::Hold {
                            handle: entry.handle,
                            needed: entry.remaining,
                            available,
                        })
                    }
                    _ => Some(QueueAction::Resume(entry.handle)),
                }
            } else if !entry.is_paused && (!within_limit || entry.user_paused) {
                Some(QueueAction::Pause(entry.handle))
            } else {
                None
            }
        })
        .collect()
}
