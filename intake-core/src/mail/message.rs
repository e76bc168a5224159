//! In-memory representation of one fetched mail, parsed from RFC822
//! bytes.

use chrono::{DateTime, TimeZone, Utc};
use mail_parser::{Address, MessageParser, MimeHeaders, PartType};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::html::html_to_text;
use crate::error::{CoreError, Result};

/// One non-body MIME part worth persisting.
#[derive(Debug, Clone)]
pub struct MailPart {
    /// Original filename; `None` for inline parts that carry none.
    pub filename: Option<String>,
    pub content_type: String,
    pub inline: bool,
    pub content_id: Option<String>,
    pub data: Vec<u8>,
}

impl MailPart {
    /// Signature image: inline image referenced by Content-ID from the
    /// HTML body.
    pub fn is_signature_image(&self) -> bool {
        self.content_type.starts_with("image/")
            && self.inline
            && self.content_id.is_some()
    }
}

/// Parsed headers, bodies, and attachment parts plus the raw bytes.
#[derive(Debug, Clone)]
pub struct ParsedMail {
    pub message_id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub parts: Vec<MailPart>,
    pub raw: Vec<u8>,
}

impl ParsedMail {
    /// Parse RFC822 bytes. Header decoding (RFC 2047) is handled by the
    /// MIME parser; a missing Message-ID is synthesized from a digest of
    /// the raw bytes so dedupe still works.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| CoreError::Mail("unparseable message".into()))?;

        let message_id = match message.message_id() {
            Some(id) => format!("<{}>", id.trim_matches(['<', '>'])),
            None => {
                let digest = Sha256::digest(raw);
                let prefix: String =
                    digest[..8].iter().map(|b| format!("{b:02x}")).collect();
                format!("<{prefix}@intake.generated>")
            }
        };

        let (sender, sender_name) = message
            .from()
            .and_then(first_address)
            .unwrap_or((String::new(), None));

        let mut recipients = collect_addresses(message.to());
        recipients.extend(collect_addresses(message.cc()));

        let date = message.date().and_then(|dt| {
            Utc.timestamp_opt(dt.to_timestamp(), 0).single()
        });

        let body_text = message
            .body_text(0)
            .map(|text| text.into_owned())
            .filter(|text| !text.trim().is_empty());
        let body_html = message.body_html(0).map(|html| html.into_owned());

        let mut parts = Vec::new();
        for part in &message.parts {
            if matches!(
                part.body,
                PartType::Multipart(_) | PartType::Message(_)
            ) {
                continue;
            }

            let disposition = part.content_disposition();
            let is_attachment =
                disposition.is_some_and(|d| d.ctype() == "attachment");
            let inline = disposition.is_some_and(|d| d.ctype() == "inline");
            let content_id = part
                .content_id()
                .map(|id| id.trim_matches(['<', '>']).to_owned());

            // Body parts stay out unless explicitly marked as attachments.
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{subtype}", ct.ctype()),
                    None => ct.ctype().to_owned(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_owned());
            if matches!(content_type.as_str(), "text/plain" | "text/html")
                && !is_attachment
            {
                continue;
            }
            if !is_attachment && !(inline && content_id.is_some()) {
                continue;
            }

            let data = part.contents().to_vec();
            if data.is_empty() {
                warn!(content_type, "skipping undecodable mail part");
                continue;
            }

            parts.push(MailPart {
                filename: part.attachment_name().map(str::to_owned),
                content_type,
                inline,
                content_id,
                data,
            });
        }

        Ok(Self {
            message_id,
            sender,
            sender_name,
            recipients,
            subject: message.subject().unwrap_or_default().to_owned(),
            date,
            body_text,
            body_html,
            parts,
            raw: raw.to_vec(),
        })
    }

    /// Plain body, falling back to a text rendering of the HTML body.
    pub fn text_content(&self) -> String {
        if let Some(text) = &self.body_text {
            return text.clone();
        }
        self.body_html.as_deref().map(html_to_text).unwrap_or_default()
    }
}

fn first_address(address: &Address<'_>) -> Option<(String, Option<String>)> {
    all_addresses(address).into_iter().next()
}

fn collect_addresses(address: Option<&Address<'_>>) -> Vec<String> {
    address
        .map(|a| all_addresses(a).into_iter().map(|(addr, _)| addr).collect())
        .unwrap_or_default()
}

fn all_addresses(address: &Address<'_>) -> Vec<(String, Option<String>)> {
    let addrs: Vec<_> = match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => {
            groups.iter().flat_map(|g| g.addresses.iter()).collect()
        }
    };
    addrs
        .into_iter()
        .filter_map(|addr| {
            addr.address.as_deref().map(|a| {
                (a.to_owned(), addr.name.as_deref().map(str::to_owned))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"Message-ID: <rfq-1@ex.com>\r\n\
From: Buyer <buyer@ex.com>\r\n\
To: sales@intake.example\r\n\
Cc: ops@intake.example\r\n\
Subject: RFQ 100 units widget A\r\n\
Date: Fri, 14 Mar 2025 09:26:53 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Please quote 100 pcs. Target price 50 USD.\r\n";

    fn multipart_with_inline_image() -> Vec<u8> {
        let boundary = "xyzzy";
        format!(
            "Message-ID: <pic-1@ex.com>\r\n\
From: sender@ex.com\r\n\
To: inbox@intake.example\r\n\
Subject: with images\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/related; boundary=\"{boundary}\"\r\n\
\r\n\
--{boundary}\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>See logo <img src=\"cid:logo-1\"></p>\r\n\
--{boundary}\r\n\
Content-Type: image/png\r\n\
Content-Disposition: inline\r\n\
Content-ID: <logo-1>\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgoAAAANSUhEUg==\r\n\
--{boundary}\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"quote.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--{boundary}--\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn parses_headers_and_body() {
        let mail = ParsedMail::parse(SIMPLE).unwrap();
        assert_eq!(mail.message_id, "<rfq-1@ex.com>");
        assert_eq!(mail.sender, "buyer@ex.com");
        assert_eq!(mail.sender_name.as_deref(), Some("Buyer"));
        assert_eq!(mail.recipients, vec![
            "sales@intake.example".to_owned(),
            "ops@intake.example".to_owned(),
        ]);
        assert_eq!(mail.subject, "RFQ 100 units widget A");
        assert!(mail.date.is_some());
        assert!(mail.text_content().contains("100 pcs"));
        assert!(mail.parts.is_empty());
    }

    #[test]
    fn classifies_signature_images() {
        let mail =
            ParsedMail::parse(&multipart_with_inline_image()).unwrap();
        assert_eq!(mail.parts.len(), 2);

        let inline = mail
            .parts
            .iter()
            .find(|p| p.content_type == "image/png")
            .unwrap();
        assert!(inline.inline);
        assert_eq!(inline.content_id.as_deref(), Some("logo-1"));
        assert!(inline.is_signature_image());

        let pdf = mail
            .parts
            .iter()
            .find(|p| p.content_type == "application/pdf")
            .unwrap();
        assert_eq!(pdf.filename.as_deref(), Some("quote.pdf"));
        assert!(!pdf.is_signature_image());
    }

    #[test]
    fn missing_message_id_is_synthesized_deterministically() {
        let raw = b"From: a@b.c\r\nSubject: x\r\n\r\nbody\r\n";
        let first = ParsedMail::parse(raw).unwrap();
        let second = ParsedMail::parse(raw).unwrap();
        assert_eq!(first.message_id, second.message_id);
        assert!(first.message_id.ends_with("@intake.generated>"));
    }

    #[test]
    fn html_only_mail_derives_text() {
        let raw = b"Message-ID: <h@x>\r\nFrom: a@b.c\r\n\
Content-Type: text/html\r\n\r\n<p>hello <b>world</b></p>\r\n";
        let mail = ParsedMail::parse(raw).unwrap();
        assert_eq!(mail.text_content(), "hello world");
    }
}
