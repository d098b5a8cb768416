//! In-memory relay record store

use super::record::{RelayHandle, RelayState, TxRelayRecord};
use crate::error::{RelayerError, RelayerResult};

use dashmap::DashMap;
use serde::Serialize;

/// Relay records keyed by handle
#[derive(Default)]
pub struct RelayStore {
    records: DashMap<RelayHandle, TxRelayRecord>,
}

impl RelayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: TxRelayRecord) {
        self.records.insert(record.handle, record);
    }

    /// Snapshot of one record
    pub fn get(&self, handle: &RelayHandle) -> RelayerResult<TxRelayRecord> {
        self.records
            .get(handle)
            .map(|r| r.clone())
            .ok_or_else(|| RelayerError::RelayNotFound {
                handle: handle.to_string(),
            })
    }

    /// Mutate one record in place under its shard lock
    pub fn update<T>(
        &self,
        handle: &RelayHandle,
        f: impl FnOnce(&mut TxRelayRecord) -> RelayerResult<T>,
    ) -> RelayerResult<T> {
        let mut record = self
            .records
            .get_mut(handle)
            .ok_or_else(|| RelayerError::RelayNotFound {
                handle: handle.to_string(),
            })?;
        f(record.value_mut())
    }

    /// Handles of records that are not terminal yet
    pub fn active_handles(&self) -> Vec<RelayHandle> {
        self.records
            .iter()
            .filter(|entry| !entry.state.is_terminal())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn stats(&self) -> RelayStats {
        let mut stats = RelayStats::default();
        for entry in self.records.iter() {
            match entry.state {
                RelayState::Pending => stats.pending += 1,
                RelayState::Stale => stats.stale += 1,
                RelayState::Mined => stats.mined += 1,
                RelayState::Confirmed => stats.confirmed += 1,
                RelayState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget terminal records, keeping at most `keep` of them
    pub fn prune_terminal(&self, keep: usize) {
        let mut terminal: Vec<_> = self
            .records
            .iter()
            .filter(|entry| entry.state.is_terminal())
            .map(|entry| (entry.submitted_at, *entry.key()))
            .collect();

        if terminal.len() <= keep {
            return;
        }

        terminal.sort_unstable_by_key(|(submitted_at, _)| *submitted_at);
        let excess = terminal.len() - keep;
        for (_, handle) in terminal.into_iter().take(excess) {
            self.records.remove(&handle);
        }
    }
}

/// Relay counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub pending: u64,
    pub stale: u64,
    pub mined: u64,
    pub confirmed: u64,
    pub failed: u64,
}
