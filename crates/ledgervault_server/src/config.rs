//! Server configuration.

use crate::auth::AuthConfig;
use std::time::Duration;

/// Configuration for the vault server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Signature freshness rules.
    pub auth: AuthConfig,
    /// Largest accepted `encrypted_data` of an update, in bytes.
    pub max_update_bytes: usize,
    /// Largest page returned by `sync.fetchSince`.
    pub max_fetch_batch: u32,
    /// Pending updates after which a vault should be compacted.
    pub compaction_threshold: usize,
    /// Drop updates folded into a new snapshot.
    pub prune_after_compaction: bool,
    /// Presence entries without a heartbeat for this long are expired.
    pub presence_timeout: Duration,
    /// Longest invite lifetime; longer requests are clamped.
    pub invite_max_ttl: Duration,
    /// Let non-owner members invite (as members only).
    pub members_can_invite: bool,
    /// Include internal error details in responses. Development only.
    pub expose_error_details: bool,
}

impl ServerConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            auth: AuthConfig::default(),
            max_update_bytes: 1024 * 1024,
            max_fetch_batch: 500,
            compaction_threshold: 200,
            prune_after_compaction: false,
            presence_timeout: Duration::from_secs(30),
            invite_max_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            members_can_invite: false,
            expose_error_details: false,
        }
    }

    /// Sets the maximum signature age.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.auth.max_age = max_age;
        self
    }

    /// Sets how far in the future a signature timestamp may lie.
    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.auth.max_clock_skew = skew;
        self
    }

    /// Sets the maximum update payload size.
    pub fn with_max_update_bytes(mut self, bytes: usize) -> Self {
        self.max_update_bytes = bytes;
        self
    }

    /// Sets the maximum fetch page size.
    pub fn with_max_fetch_batch(mut self, size: u32) -> Self {
        self.max_fetch_batch = size.max(1);
        self
    }

    /// Sets the compaction threshold.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Prunes folded updates after each compaction.
    pub fn with_prune_after_compaction(mut self, prune: bool) -> Self {
        self.prune_after_compaction = prune;
        self
    }

    /// Sets the presence timeout.
    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self
    }

    /// Sets the maximum invite lifetime.
    pub fn with_invite_max_ttl(mut self, ttl: Duration) -> Self {
        self.invite_max_ttl = ttl;
        self
    }

    /// Lets members create member invites.
    pub fn with_members_can_invite(mut self, allowed: bool) -> Self {
        self.members_can_invite = allowed;
        self
    }

    /// Exposes internal error details in responses.
    pub fn with_error_details(mut self, expose: bool) -> Self {
        self.expose_error_details = expose;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.auth.max_age, Duration::from_secs(300));
        assert_eq!(config.auth.max_clock_skew, Duration::from_secs(30));
        assert_eq!(config.max_fetch_batch, 500);
        assert!(!config.members_can_invite);
        assert!(!config.expose_error_details);
    }

    #[test]
    fn builder_chain() {
        let config = ServerConfig::new()
            .with_max_age(Duration::from_secs(60))
            .with_max_fetch_batch(0)
            .with_prune_after_compaction(true)
            .with_members_can_invite(true);
        assert_eq!(config.auth.max_age, Duration::from_secs(60));
        assert_eq!(config.max_fetch_batch, 1);
        assert!(config.prune_after_compaction);
        assert!(config.members_can_invite);
    }
}
