//! PostgreSQL-backed repository implementations.

mod accounts;
mod events;
mod intents;
mod mail;
mod suggestions;

pub use accounts::PostgresAccountRepository;
pub use events::PostgresEventRepository;
pub use intents::PostgresIntentRepository;
pub use mail::PostgresRawMailRepository;
pub use suggestions::PostgresSuggestionRepository;
