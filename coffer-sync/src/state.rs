//! Sync-state bookkeeping: pre-sync save stamps and integrity discordance.

use chrono::{DateTime, Utc};

/// Consecutive integrity mismatches tolerated before declaring out-of-sync.
pub const MAX_DISCORDANCE: u32 = 5;

/// Result of feeding one integrity comparison into the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrityOutcome {
    /// Hashes matched; nothing was pending.
    InSync,
    /// Hashes matched after an out-of-sync episode.
    ExitedOutOfSync,
    /// Hashes differed but the threshold has not been reached.
    Discordant(u32),
    /// The threshold was just crossed.
    EnteredOutOfSync,
    /// Already out of sync; still mismatched.
    StillOutOfSync,
}

#[derive(Debug, Default)]
pub struct SyncState {
    last_pre_sync_save: Option<DateTime<Utc>>,
    discordance: u32,
    out_of_sync: bool,
    last_client_hash: Option<String>,
    last_server_hash: Option<String>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_pre_sync_save(&self) -> Option<DateTime<Utc>> {
        self.last_pre_sync_save
    }

    pub fn mark_pre_sync_save(&mut self, at: DateTime<Utc>) {
        self.last_pre_sync_save = Some(at);
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync
    }

    pub fn discordance(&self) -> u32 {
        self.discordance
    }

    /// Feeds one client/server hash pair into the discordance counter.
    pub fn update_integrity(&mut self, client_hash: &str, server_hash: &str) -> IntegrityOutcome {
        self.last_client_hash = Some(client_hash.to_string());
        self.last_server_hash = Some(server_hash.to_string());

        if client_hash == server_hash {
            self.discordance = 0;
            if self.out_of_sync {
                self.out_of_sync = false;
                return IntegrityOutcome::ExitedOutOfSync;
            }
            return IntegrityOutcome::InSync;
        }

        if self.out_of_sync {
            return IntegrityOutcome::StillOutOfSync;
        }
        self.discordance += 1;
        if self.discordance >= MAX_DISCORDANCE {
            self.out_of_sync = true;
            return IntegrityOutcome::EnteredOutOfSync;
        }
        IntegrityOutcome::Discordant(self.discordance)
    }
}
