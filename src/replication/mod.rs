//! Leader/follower replication: the handshake, the write-propagation
//! broadcast, the unbounded command log used to catch up a just-attached
//! follower, and the offset bookkeeping `INFO replication` and
//! `REPLCONF GETACK` report back.
//!
//! Grounded in the teacher's `ReplicationState` (a small struct tracking
//! `current_lsn`/slot name behind an atomic-and-mutex pair, exercised by a
//! colocated `#[cfg(test)] mod tests`) generalized from a single-upstream
//! WAL LSN to a leader's fan-out offset and a follower's applied offset.

pub mod follower;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::Rng;
use tokio::sync::mpsc;

/// Whether this process is acting as the write leader or as a follower of
/// some other leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// The command log plus the live follower senders, behind one lock so a
/// follower attaching can never observe a write that's in neither its
/// replayed log nor its live feed.
struct LeaderState {
    command_log: Vec<Vec<u8>>,
    followers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Shared replication state, read from the command dispatcher and the
/// connection handlers.
pub struct Replication {
    role: Mutex<Role>,
    replid: String,
    /// Leader: total bytes ever propagated to followers (`master_repl_offset`).
    /// Follower: total bytes of the replication stream applied so far.
    offset: AtomicU64,
    leader: Mutex<LeaderState>,
}

fn random_replid() -> String {
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}

impl Replication {
    pub fn new(initial_role: Role) -> Self {
        Self {
            role: Mutex::new(initial_role),
            replid: random_replid(),
            offset: AtomicU64::new(0),
            leader: Mutex::new(LeaderState {
                command_log: Vec::new(),
                followers: Vec::new(),
            }),
        }
    }

    pub fn role(&self) -> Role {
        *self.role.lock().unwrap()
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Same value, named the way `REPLCONF GETACK`'s reply names it.
    pub fn applied_offset(&self) -> u64 {
        self.offset()
    }

    /// Advances the offset by the number of raw bytes just processed: on a
    /// leader, bytes just propagated; on a follower, bytes just consumed
    /// from the leader stream. Returns the offset *before* this frame, the
    /// value `REPLCONF GETACK` must report (it answers for state as of
    /// just before the GETACK frame itself).
    pub fn advance_offset(&self, frame_len: usize) -> u64 {
        self.offset.fetch_add(frame_len as u64, Ordering::SeqCst)
    }

    /// Registers a newly attached follower connection, replaying the
    /// command log accumulated so far before returning the receiving half
    /// it should forward to its socket — so a follower that attaches
    /// between snapshot materialization and registration still gets the
    /// writes that happened in between.
    pub fn register_follower(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.leader.lock().unwrap();
        for frame in &state.command_log {
            let _ = tx.send(frame.clone());
        }
        state.followers.push(tx);
        rx
    }

    /// Appends a raw, already-RESP-encoded write command to the command
    /// log, broadcasts it to every attached follower, and advances the
    /// leader's offset by its length. Dead senders (the follower's
    /// connection task has exited) are dropped.
    pub fn propagate(&self, frame: &[u8]) {
        let mut state = self.leader.lock().unwrap();
        state.command_log.push(frame.to_vec());
        state.followers.retain(|tx| tx.send(frame.to_vec()).is_ok());
        self.offset.fetch_add(frame.len() as u64, Ordering::SeqCst);
    }

    /// Builds the `FULLRESYNC <replid> 0` reply line for PSYNC. The
    /// offset here is always 0: catching a late-attaching follower up to
    /// the leader's current offset is the command log replay's job
    /// (`register_follower`), not the handshake line's.
    pub fn full_resync_line(&self) -> String {
        format!("FULLRESYNC {} 0", self.replid)
    }

    pub fn info_replication(&self) -> String {
        let role = match self.role() {
            Role::Leader => "master",
            Role::Follower => "slave",
        };
        format!(
            "role:{role}\r\nmaster_repl_offset:{}\r\nmaster_replid:{}\r\n",
            self.offset(),
            self.replid
        )
    }
}
