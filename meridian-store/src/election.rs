//! In-process leader election.
//!
//! Candidates queue per election key in the order they joined. The head of
//! the queue holds the lease; when it resigns or its lease is expired the
//! next live candidate is promoted. Lease durations are recorded but not
//! timed: every candidate lives in this process, so there is no session to
//! lose except through [`MemoryElector::expire`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use meridian_core::{ElectionEvents, Elector, Leadership, StoreError};

#[derive(Debug)]
struct Candidate {
    name: String,
    lease: Duration,
    events: mpsc::UnboundedSender<Leadership>,
}

impl Candidate {
    fn tell(&self, leadership: Leadership) {
        if self.events.send(leadership).is_err() {
            debug!(candidate = %self.name, %leadership, "candidate stopped listening");
        }
    }
}

/// Candidates for one key; index 0 is the leader.
#[derive(Debug, Default)]
struct Election {
    candidates: Vec<Candidate>,
}

impl Election {
    fn leader(&self) -> Option<&str> {
        self.candidates.first().map(|c| c.name.as_str())
    }

    fn promote_head(&self, key: &str) {
        if let Some(head) = self.candidates.first() {
            info!(key, candidate = %head.name, lease = ?head.lease, "candidate elected");
            head.tell(Leadership::Leader);
        }
    }
}

/// A leader-election primitive for candidates sharing one process.
#[derive(Debug, Default)]
pub struct MemoryElector {
    elections: Mutex<HashMap<String, Election>>,
}

impl MemoryElector {
    /// Create an elector with no elections.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current leader for `key`, if any.
    pub fn leader(&self, key: &str) -> Option<String> {
        let elections = self.elections.lock().unwrap_or_else(PoisonError::into_inner);
        elections.get(key).and_then(Election::leader).map(str::to_string)
    }

    /// Simulate the leader's lease running out: the leader is demoted to the
    /// back of the queue and the next candidate is promoted.
    ///
    /// Returns the demoted candidate, if there was a leader.
    pub fn expire(&self, key: &str) -> Option<String> {
        let mut elections = self.elections.lock().unwrap_or_else(PoisonError::into_inner);
        let election = elections.get_mut(key)?;
        if election.candidates.is_empty() {
            return None;
        }

        let demoted = election.candidates.remove(0);
        demoted.tell(Leadership::Follower);
        let name = demoted.name.clone();
        election.candidates.push(demoted);
        election.candidates.retain(|c| !c.events.is_closed());

        // A sole candidate gets the lease straight back.
        election.promote_head(key);
        Some(name)
    }
}

#[async_trait]
impl Elector for MemoryElector {
    async fn campaign(
        &self,
        key: &str,
        candidate: &str,
        lease: Duration,
    ) -> Result<ElectionEvents, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut elections = self.elections.lock().unwrap_or_else(PoisonError::into_inner);
        let election = elections.entry(key.to_string()).or_default();

        election.candidates.retain(|c| !c.events.is_closed());
        if election.candidates.iter().any(|c| c.name == candidate) {
            return Err(StoreError::Election {
                key: key.to_string(),
                reason: format!("candidate '{candidate}' is already running"),
            });
        }

        let entry = Candidate {
            name: candidate.to_string(),
            lease,
            events: tx,
        };
        if election.candidates.is_empty() {
            election.candidates.push(entry);
            election.promote_head(key);
        } else {
            debug!(key, candidate, "joined election as follower");
            entry.tell(Leadership::Follower);
            election.candidates.push(entry);
        }
        Ok(rx)
    }

    async fn resign(&self, key: &str, candidate: &str) -> Result<(), StoreError> {
        let mut elections = self.elections.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(election) = elections.get_mut(key) else {
            return Ok(());
        };
        let Some(pos) = election.candidates.iter().position(|c| c.name == candidate) else {
            return Ok(());
        };

        let resigned = election.candidates.remove(pos);
        info!(key, candidate, was_leader = pos == 0, "candidate resigned");
        if pos == 0 {
            resigned.tell(Leadership::Follower);
            election.candidates.retain(|c| !c.events.is_closed());
            election.promote_head(key);
        }
        Ok(())
    }
}
