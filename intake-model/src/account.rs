//! Admin-managed mail account configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One IMAP-capable mail account. Rows live in `email_accounts`; a
/// fallback account may be assembled from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAccount {
    /// Database id; `None` for the environment fallback account.
    pub id: Option<i64>,
    pub name: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_use_ssl: bool,
    pub imap_user: String,
    pub imap_password: String,
    pub imap_folder: String,
    pub imap_mark_as_read: bool,
    /// Initial sync window in days; `None` means "from epoch".
    pub imap_sync_days: Option<i64>,
    pub imap_unseen_only: bool,
    pub imap_fetch_limit: usize,
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl EmailAccount {
    /// Key under which this account's worker state (checkpoint, lock)
    /// lives in the broker.
    pub fn worker_key(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => "env".into(),
        }
    }
}
