//! Store configuration.

/// Configuration for a [`crate::VaultStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Sync the journal to disk after every record instead of only
    /// flushing it to the operating system.
    pub sync_on_write: bool,
    /// Create the store directory if it does not exist.
    pub create_if_missing: bool,
}

impl StoreConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sync_on_write: true,
            create_if_missing: true,
        }
    }

    /// Sets whether every record is synced.
    #[must_use]
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets whether a missing directory is created.
    #[must_use]
    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}
