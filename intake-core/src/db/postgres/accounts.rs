use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_model::EmailAccount;
use sqlx::PgPool;

use crate::db::ports::AccountRepository;
use crate::error::Result;

/// PostgreSQL-backed implementation of the `AccountRepository` port.
#[derive(Clone)]
pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct AccountDto {
    id: i64,
    name: String,
    imap_host: String,
    imap_port: i32,
    imap_use_ssl: bool,
    imap_user: String,
    imap_password: String,
    imap_folder: String,
    imap_mark_as_read: bool,
    imap_sync_days: Option<i64>,
    imap_unseen_only: bool,
    imap_fetch_limit: i32,
    active: bool,
    created_at: DateTime<Utc>,
}

impl From<AccountDto> for EmailAccount {
    fn from(dto: AccountDto) -> Self {
        EmailAccount {
            id: Some(dto.id),
            name: dto.name,
            imap_host: dto.imap_host,
            imap_port: dto.imap_port as u16,
            imap_use_ssl: dto.imap_use_ssl,
            imap_user: dto.imap_user,
            imap_password: dto.imap_password,
            imap_folder: dto.imap_folder,
            imap_mark_as_read: dto.imap_mark_as_read,
            imap_sync_days: dto.imap_sync_days,
            imap_unseen_only: dto.imap_unseen_only,
            imap_fetch_limit: dto.imap_fetch_limit.max(1) as usize,
            active: dto.active,
            created_at: Some(dto.created_at),
        }
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn list_active_imap(&self) -> Result<Vec<EmailAccount>> {
        let dtos: Vec<AccountDto> = sqlx::query_as(
            "SELECT id, name, imap_host, imap_port, imap_use_ssl, imap_user, \
             imap_password, imap_folder, imap_mark_as_read, imap_sync_days, \
             imap_unseen_only, imap_fetch_limit, active, created_at \
             FROM email_accounts \
             WHERE active AND imap_host <> '' \
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(dtos.into_iter().map(EmailAccount::from).collect())
    }
}
