//! Shared configuration library for Intake.
//!
//! Centralizes `.env` + environment loading and validation so the server
//! binary and the integration harnesses agree on defaults and variable
//! names. All durations accept humantime syntax (`30s`, `2m`, `1h`).

pub mod loader;
pub mod models;

pub use loader::{ConfigError, load, load_from};
pub use models::{
    ApprovalsConfig, ClassifierConfig, Config, DatabaseConfig,
    DispatcherConfig, HttpConfig, ImapConfig, LocalStorageConfig,
    RedisConfig, RemoteStoreConfig, SmtpConfig,
};
