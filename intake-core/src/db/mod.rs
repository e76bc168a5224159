//! Persistence layer: repository ports plus their PostgreSQL and
//! in-memory implementations.
//!
//! Every unit of work uses its own short-lived session from the shared
//! pool. Uniqueness rules (idempotency key, Message-ID, pending
//! suggestions) are enforced by database constraints, not in-process
//! locks; the in-memory implementations mirror those constraints for the
//! integration suites.

pub mod memory;
pub mod ports;
pub mod postgres;

pub use memory::{
    InMemoryAccountRepository, InMemoryEventRepository,
    InMemoryIntentRepository, InMemoryRawMailRepository,
    InMemorySuggestionRepository,
};
pub use ports::{
    AccountRepository, EventRepository, InsertOutcome, IntentRepository,
    RawMailRepository, SuggestionRepository,
};
pub use postgres::{
    PostgresAccountRepository, PostgresEventRepository,
    PostgresIntentRepository, PostgresRawMailRepository,
    PostgresSuggestionRepository,
};
