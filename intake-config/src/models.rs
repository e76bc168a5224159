//! Configuration section structs.

use std::path::PathBuf;
use std::time::Duration;

use intake_model::EmailAccount;

#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    /// Remote object-store credentials; absence forces the local backend.
    pub remote_store: Option<RemoteStoreConfig>,
    pub local_storage: LocalStorageConfig,
    pub imap: ImapConfig,
    pub dispatcher: DispatcherConfig,
    pub classifier: ClassifierConfig,
    /// Outbound notification surface; absence downgrades to a no-op.
    pub smtp: Option<SmtpConfig>,
    pub approvals: ApprovalsConfig,
}

#[derive(Debug, Clone)]
pub struct ApprovalsConfig {
    /// Address approval and manual-review notifications target.
    pub approver: Option<String>,
    /// Default decision window for escalation holds.
    pub timeout_hours: f64,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    /// Per-call deadline for object-store I/O.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LocalStorageConfig {
    pub enabled: bool,
    pub path: PathBuf,
    /// Base URL under which the server exposes local blobs for signed
    /// URLs, e.g. `http://localhost:8500`.
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct ImapConfig {
    /// Poll interval per account tick.
    pub poll_interval: Duration,
    /// Safety margin added to the distributed-lock TTL on top of the
    /// interval.
    pub lock_margin: Duration,
    pub fetch_limit: usize,
    /// Fallback account assembled from `IMAP_*` variables when no rows
    /// exist in `email_accounts`.
    pub env_account: Option<EmailAccount>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of consumer slots in the `event-processors` group.
    pub consumers: usize,
    /// XREADGROUP block timeout.
    pub block: Duration,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// HTTP classifier endpoint; absence selects the keyword classifier.
    pub endpoint: Option<String>,
    pub deadline: Duration,
    /// Minimum confidence before a proposed new intent becomes a pending
    /// suggestion.
    pub suggest_threshold: f64,
    /// Minimum confidence before an existing match is accepted.
    pub accept_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
}
