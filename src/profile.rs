//! Per-process profile bookkeeping.
//!
//! Each `Profile` event starts a [`ProfileState`] for its pid. Later
//! `ProfileChunk` events for the same pid extend that profile's call tree and
//! feed its samples, in order, to the stack reconstructor.

use crate::stack::ProfileState;
use crate::trace::{ProfileChunkData, SpallEvent};
use log::{debug, warn};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur while routing profile data.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProfileError {
    #[error("got a ProfileChunk for pid {pid}, but never saw a Profile event for that pid")]
    UnknownProfile { pid: i64 },
}

pub type Result<T> = std::result::Result<T, ProfileError>;

/// All profiles seen so far, keyed by pid.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<i64, ProfileState>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the profile for `pid`.
    ///
    /// Restarting discards the previous profile's call tree and open frames
    /// without closing them.
    pub fn start_profile(&mut self, pid: i64, start_time: i64) {
        debug!("Starting profile for pid {pid} at {start_time}");
        if let Some(previous) = self.profiles.insert(pid, ProfileState::new(start_time)) {
            if !previous.stack.is_empty() {
                debug!(
                    "Discarding {} open frames of the previous profile for pid {pid} after {}us",
                    previous.stack.len(),
                    previous.elapsed()
                );
            }
        }
    }

    /// Apply one chunk to the profile for `pid`, appending emitted events.
    ///
    /// Returns the number of samples processed. A chunk for an unknown pid
    /// is rejected before anything is applied.
    pub fn ingest_chunk(
        &mut self,
        pid: i64,
        tid: i64,
        chunk: ProfileChunkData,
        events: &mut Vec<SpallEvent>,
    ) -> Result<usize> {
        let state = self
            .profiles
            .get_mut(&pid)
            .ok_or(ProfileError::UnknownProfile { pid })?;

        let ProfileChunkData {
            cpu_profile,
            time_deltas,
        } = chunk;

        let added = state.merge_nodes(cpu_profile.nodes);
        if added > 0 {
            debug!("Added {added} nodes to profile for pid {pid}");
        }

        if cpu_profile.samples.len() != time_deltas.len() {
            warn!(
                "ProfileChunk for pid {pid} has {} samples but {} time deltas; ignoring the excess",
                cpu_profile.samples.len(),
                time_deltas.len()
            );
        }

        state.tid = tid;
        let mut processed = 0;
        for (&sample, &delta) in cpu_profile.samples.iter().zip(&time_deltas) {
            state.advance(pid, tid, sample, delta, events);
            processed += 1;
        }

        Ok(processed)
    }

    pub fn get(&self, pid: i64) -> Option<&ProfileState> {
        self.profiles.get(&pid)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Close every open frame of every profile, in ascending pid order.
    pub fn close_all(&mut self, events: &mut Vec<SpallEvent>) {
        for (&pid, state) in &mut self.profiles {
            let tid = state.tid;
            state.close_all(pid, tid, events);
        }
    }
}
