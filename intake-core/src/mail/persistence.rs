//! Raw-mail persistence: `.eml` blob, attachment blobs, metadata rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use intake_model::{AttachmentRow, RawMailRecord};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::message::ParsedMail;
use crate::db::RawMailRepository;
use crate::error::{CoreError, Result};
use crate::storage::{BlobStorage, UrlMethod};

pub struct MailPersistor {
    repo: Arc<dyn RawMailRepository>,
    storage: BlobStorage,
}

impl MailPersistor {
    pub fn new(repo: Arc<dyn RawMailRepository>, storage: BlobStorage) -> Self {
        Self { repo, storage }
    }

    /// Persist one mail: raw `.eml` first, then the metadata row, then
    /// each attachment. Idempotent on the provider Message-ID. A failed
    /// raw upload aborts with no row; a failed attachment upload keeps
    /// the mail row and omits that attachment.
    pub async fn persist(
        &self,
        mail: &ParsedMail,
        account_id: Option<i64>,
    ) -> Result<RawMailRecord> {
        if let Some(existing) =
            self.repo.find_by_message_id(&mail.message_id).await?
        {
            debug!(message_id = %mail.message_id, "mail already persisted");
            return Ok(existing);
        }

        let now = Utc::now();
        let record_id = Uuid::new_v4();
        let account_prefix = account_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "env".to_owned());
        let date_str = now.format("%Y-%m-%d").to_string();

        let raw_key = format!(
            "emails/raw/{account_prefix}/{date_str}/{record_id}.eml"
        );
        let storage = self
            .storage
            .put(&raw_key, &mail.raw, "message/rfc822")
            .await?;
        info!(
            message_id = %mail.message_id,
            key = %storage.key,
            backend = %storage.backend,
            "stored raw mail"
        );

        let record = RawMailRecord {
            id: record_id,
            account_id,
            message_id: mail.message_id.clone(),
            sender: mail.sender.clone(),
            sender_name: mail.sender_name.clone(),
            recipients: mail.recipients.clone(),
            subject: mail.subject.clone(),
            body_text: mail.text_content(),
            received_at: mail.date.unwrap_or(now),
            storage,
            size_bytes: mail.raw.len() as i64,
            event_id: None,
            processed_at: None,
            created_at: now,
        };

        match self.repo.insert(&record).await {
            Ok(()) => {}
            // Lost a race on Message-ID; the winner's row is the record.
            Err(CoreError::Conflict(_)) => {
                if let Some(existing) =
                    self.repo.find_by_message_id(&mail.message_id).await?
                {
                    return Ok(existing);
                }
                return Err(CoreError::Internal(format!(
                    "mail {} vanished after conflict",
                    mail.message_id
                )));
            }
            Err(e) => return Err(e),
        }

        let mut stored = 0usize;
        for part in &mail.parts {
            let attachment_id = Uuid::new_v4();
            let filename = part.filename.clone().unwrap_or_else(|| {
                let ext = part
                    .content_type
                    .rsplit('/')
                    .next()
                    .unwrap_or("bin");
                let nonce = attachment_id.simple().to_string();
                format!("inline_{}.{ext}", &nonce[..8])
            });

            let key = format!(
                "emails/attachments/{account_prefix}/{date_str}/{attachment_id}/{}",
                urlencoding::encode(&filename),
            );
            let pointer = match self
                .storage
                .put(&key, &part.data, &part.content_type)
                .await
            {
                Ok(pointer) => pointer,
                Err(e) => {
                    error!(filename, error = %e, "attachment upload failed, skipping");
                    continue;
                }
            };

            let row = AttachmentRow {
                id: attachment_id,
                mail_id: record.id,
                filename,
                content_type: part.content_type.clone(),
                size_bytes: part.data.len() as i64,
                storage: pointer,
                inline: part.inline,
                content_id: part.content_id.clone(),
                is_signature: part.is_signature_image(),
                created_at: now,
            };
            if let Err(e) = self.repo.insert_attachment(&row).await {
                error!(
                    attachment_id = %row.id,
                    error = %e,
                    "attachment row insert failed, skipping"
                );
                continue;
            }
            stored += 1;
        }

        info!(
            mail_id = %record.id,
            message_id = %record.message_id,
            attachments = stored,
            "persisted mail"
        );
        Ok(record)
    }

    /// Link the mail back to its event row and stamp processing time.
    pub async fn mark_processed(
        &self,
        mail_id: Uuid,
        event_id: Uuid,
    ) -> Result<()> {
        self.repo.mark_processed(mail_id, event_id, Utc::now()).await
    }

    /// Time-limited download URL for a stored attachment.
    pub async fn attachment_url(
        &self,
        attachment_id: Uuid,
        ttl: Duration,
    ) -> Result<String> {
        let row = self.repo.attachment(attachment_id).await?.ok_or_else(
            || CoreError::NotFound(format!("attachment {attachment_id}")),
        )?;
        self.storage.signed_url(&row.storage, ttl, UrlMethod::Get).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryRawMailRepository;
    use crate::storage::{LocalDiskStore, MemoryTokenStore};

    fn storage(dir: &tempfile::TempDir) -> BlobStorage {
        BlobStorage::new(
            None,
            Some(Arc::new(LocalDiskStore::new(
                dir.path().to_path_buf(),
                "http://localhost:8500".into(),
                Arc::new(MemoryTokenStore::new()),
            ))),
        )
    }

    fn mail_with_attachment() -> ParsedMail {
        let raw = format!(
            "Message-ID: <m-1@ex.com>\r\n\
From: Sender <sender@ex.com>\r\n\
To: inbox@intake.example\r\n\
Subject: spec sheet\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attachment\r\n\
--b1\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"spec sheet.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--b1--\r\n"
        );
        ParsedMail::parse(raw.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn persisting_twice_yields_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryRawMailRepository::new());
        let persistor = MailPersistor::new(repo.clone(), storage(&dir));
        let mail = mail_with_attachment();

        let first = persistor.persist(&mail, Some(7)).await.unwrap();
        let second = persistor.persist(&mail, Some(7)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(repo.mail_count(), 1);

        // Attachment set is stable across replays.
        let attachments = repo.attachments_for(first.id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "spec sheet.pdf");
        assert!(!attachments[0].is_signature);
        assert!(
            attachments[0].storage.key.contains("spec%20sheet.pdf"),
            "filename must be url-encoded in the storage key: {}",
            attachments[0].storage.key
        );
    }

    #[tokio::test]
    async fn key_layout_follows_account_and_date() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryRawMailRepository::new());
        let persistor = MailPersistor::new(repo, storage(&dir));

        let record = persistor
            .persist(&mail_with_attachment(), Some(12))
            .await
            .unwrap();
        assert!(record.storage.key.starts_with("emails/raw/12/"));
        assert!(record.storage.key.ends_with(&format!("{}.eml", record.id)));

        let env_mail = ParsedMail::parse(
            b"Message-ID: <m-2@ex.com>\r\nFrom: a@b.c\r\n\r\nhello\r\n",
        )
        .unwrap();
        let env_record = persistor.persist(&env_mail, None).await.unwrap();
        assert!(env_record.storage.key.starts_with("emails/raw/env/"));
    }

    #[tokio::test]
    async fn mark_processed_links_event() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryRawMailRepository::new());
        let persistor = MailPersistor::new(repo.clone(), storage(&dir));

        let record = persistor
            .persist(&mail_with_attachment(), None)
            .await
            .unwrap();
        let event_id = Uuid::new_v4();
        persistor.mark_processed(record.id, event_id).await.unwrap();

        let stored =
            repo.find_by_message_id(&record.message_id).await.unwrap().unwrap();
        assert_eq!(stored.event_id, Some(event_id));
        assert!(stored.processed_at.is_some());
    }
}
