use std::sync::Arc;

use http::Method;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProxyError;
use crate::mail::UpstreamMessage;
use crate::spool::Spool;
use crate::upstream::UpstreamAdapter;

/// A single message as listed by a POP3 session (§3 "Session Message
/// Descriptor").
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub id: String,
    pub size: u64,
    pub etag: String,
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone)]
pub struct AttachmentRef {
    pub id: String,
    pub size: u64,
}

/// The higher-level verbs built on the Mail Translator and Upstream Adapter
/// (§4.5): send, list, fetch_raw, delete.
pub struct MailboxOperations {
    adapter: Arc<UpstreamAdapter>,
    spool: Arc<Spool>,
}

impl MailboxOperations {
    pub fn new(adapter: Arc<UpstreamAdapter>, spool: Arc<Spool>) -> Self {
        Self { adapter, spool }
    }

    /// Sends a message already translated to the upstream representation,
    /// falling back to spooling it when the upstream is unreachable or fails
    /// transiently.
    pub async fn send(
        &self,
        mailbox: &str,
        mail_from: &str,
        rcpt_tos: &[String],
        raw_bytes: &[u8],
        message: &UpstreamMessage,
    ) -> Result<bool, ProxyError> {
        let path = format!("/users/{mailbox}/sendMail");
        let body = serde_json::json!({ "message": to_graph_message(message) });

        let spool = self.spool.clone();
        let mail_from_owned = mail_from.to_string();
        let rcpt_tos_owned = rcpt_tos.to_vec();
        let raw_owned = raw_bytes.to_vec();

        self.adapter
            .safe_call(
                move || {
                    if let Err(err) = spool.enqueue(&mail_from_owned, &rcpt_tos_owned, &raw_owned)
                    {
                        warn!("failed to spool undeliverable message: {err}");
                        return false;
                    }
                    true
                },
                || async {
                    let response = self.adapter.call(Method::POST, path, Some(body)).await?;
                    Ok(matches!(response.status, 200 | 202))
                },
            )
            .await
    }

    /// Lists the inbox, paginating and enriching each stub with size and
    /// ETag, per §4.5.
    pub async fn list(&self, mailbox: &str) -> Result<Vec<Descriptor>, ProxyError> {
        self.adapter
            .safe_call(Vec::new, || async { self.list_uncached(mailbox).await })
            .await
    }

    async fn list_uncached(&self, mailbox: &str) -> Result<Vec<Descriptor>, ProxyError> {
        let mut descriptors = Vec::new();
        let mut path = format!("/users/{mailbox}/mailFolders/Inbox/messages?$top=50");

        loop {
            let response = self.adapter.call(Method::GET, path.clone(), None).await?;
            let page: ListPage = response
                .json()
                .map_err(|e| ProxyError::UpstreamPermanent(e.to_string()))?;

            for stub in page.value {
                descriptors.push(self.describe_message(mailbox, &stub.id).await?);
            }

            match page.next_link {
                Some(next) => path = next,
                None => break,
            }
        }

        Ok(descriptors)
    }

    async fn describe_message(&self, mailbox: &str, id: &str) -> Result<Descriptor, ProxyError> {
        let detail_path = format!("/users/{mailbox}/messages/{id}");
        let detail_response = self.adapter.call(Method::GET, detail_path, None).await?;
        let etag = detail_response.etag().unwrap_or_default();
        let detail: MessageDetail = detail_response
            .json()
            .map_err(|e| ProxyError::UpstreamPermanent(e.to_string()))?;

        let mut size = detail.size;
        let mut attachments = Vec::new();

        if detail.has_attachments {
            let attachments_path =
                format!("/users/{mailbox}/messages/{id}/attachments?$select=id,size");
            let attachments_response = self
                .adapter
                .call(Method::GET, attachments_path, None)
                .await?;
            let page: AttachmentsPage = attachments_response
                .json()
                .map_err(|e| ProxyError::UpstreamPermanent(e.to_string()))?;

            for attachment in page.value {
                size += attachment.size;
                attachments.push(AttachmentRef {
                    id: attachment.id,
                    size: attachment.size,
                });
            }
        }

        Ok(Descriptor {
            id: id.to_string(),
            size,
            etag,
            attachments,
        })
    }

    /// Fetches the raw RFC 5322 bytes of a message.
    pub async fn fetch_raw(&self, mailbox: &str, id: &str) -> Result<Option<Vec<u8>>, ProxyError> {
        let path = format!("/users/{mailbox}/messages/{id}/$value");
        self.adapter
            .safe_call(
                || None,
                || async {
                    let response = self.adapter.call(Method::GET, path, None).await?;
                    Ok(Some(response.body))
                },
            )
            .await
    }

    /// Deletes a message conditionally on its ETag. A 412 (concurrent
    /// modification) is logged but reported as a non-fatal outcome, per §4.5
    /// and the Design Notes in §9.
    pub async fn delete(&self, mailbox: &str, id: &str, etag: &str) -> Result<bool, ProxyError> {
        let path = format!("/users/{mailbox}/messages/{id}");
        let if_match = etag.to_string();

        self.adapter
            .safe_call(
                || false,
                || async {
                    let response = self
                        .adapter
                        .call_with_headers(
                            Method::DELETE,
                            path,
                            None,
                            vec![("If-Match", if_match)],
                        )
                        .await;

                    match response {
                        Ok(response) if response.status == 204 => Ok(true),
                        Err(ProxyError::ConcurrentModification) => {
                            warn!("upstream reported concurrent modification on delete");
                            Ok(false)
                        }
                        Ok(_) => Ok(false),
                        Err(other) => Err(other),
                    }
                },
            )
            .await
    }
}

fn to_graph_message(message: &UpstreamMessage) -> GraphMessage {
    GraphMessage {
        subject: message.subject.clone(),
        body: GraphBody {
            content_type: match message.body.kind {
                crate::mail::BodyKind::Html => "HTML",
                crate::mail::BodyKind::Text => "Text",
            },
            content: message.body.content.clone(),
        },
        to_recipients: message.to.iter().map(|a| GraphRecipient::new(a)).collect(),
        cc_recipients: message.cc.iter().map(|a| GraphRecipient::new(a)).collect(),
        bcc_recipients: message
            .bcc
            .iter()
            .map(|a| GraphRecipient::new(a))
            .collect(),
        attachments: message
            .attachments
            .iter()
            .map(|a| GraphAttachment {
                odata_type: "#microsoft.graph.fileAttachment",
                name: a.name.clone(),
                content_bytes: a.base64_content.clone(),
                is_inline: a.inline,
                content_id: a.content_id.clone(),
            })
            .collect(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    subject: Option<String>,
    body: GraphBody,
    to_recipients: Vec<GraphRecipient>,
    cc_recipients: Vec<GraphRecipient>,
    bcc_recipients: Vec<GraphRecipient>,
    attachments: Vec<GraphAttachment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

impl GraphRecipient {
    fn new(address: &str) -> Self {
        Self {
            email_address: GraphEmailAddress {
                address: address.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct GraphEmailAddress {
    address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    #[serde(rename = "@odata.type")]
    odata_type: &'static str,
    name: String,
    content_bytes: String,
    is_inline: bool,
    content_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    value: Vec<MessageStub>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    #[serde(default)]
    size: u64,
    #[serde(default, rename = "hasAttachments")]
    has_attachments: bool,
}

#[derive(Debug, Deserialize)]
struct AttachmentsPage {
    value: Vec<AttachmentStub>,
}

#[derive(Debug, Deserialize)]
struct AttachmentStub {
    id: String,
    size: u64,
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use http::Method;

    use super::*;
    use crate::mail::{BodyKind, UpstreamBody};
    use crate::token::{TokenBundle, TokenManager, TokenStore};
    use crate::upstream::mock::MockTransport;

    fn sample_message() -> UpstreamMessage {
        UpstreamMessage {
            subject: Some("hi".into()),
            body: UpstreamBody {
                kind: BodyKind::Text,
                content: "hello".into(),
            },
            to: vec!["b@y.test".into()],
            cc: Vec::new(),
            bcc: Vec::new(),
            attachments: Vec::new(),
        }
    }

    async fn operations_with(
        transport: Arc<MockTransport>,
    ) -> (MailboxOperations, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.bin"), "client-id");
        let manager = Arc::new(TokenManager::new(
            "client-id".into(),
            "tenant".into(),
            store,
        ));
        manager.seed_for_test(TokenBundle {
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            expires_in: 3600,
            last_refresh: chrono::Utc::now(),
            scopes: Default::default(),
            extra: Default::default(),
        });

        let adapter = Arc::new(crate::upstream::UpstreamAdapter::new(transport, manager));
        let spool = Arc::new(Spool::new(dir.path().join("queue")).unwrap());
        (MailboxOperations::new(adapter, spool), dir)
    }

    #[tokio::test]
    async fn send_spools_when_upstream_unreachable() {
        let transport = Arc::new(MockTransport::new());
        transport.set_reachable(false);
        let (ops, _dir) = operations_with(transport).await;

        let accepted = ops
            .send(
                "a@x.test",
                "a@x.test",
                &["b@y.test".to_string()],
                b"From: a@x.test\r\n\r\nhi\r\n",
                &sample_message(),
            )
            .await
            .unwrap();

        assert!(accepted);
    }

    #[tokio::test]
    async fn send_succeeds_on_202() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(Method::POST, "/sendMail", 202, Vec::new());
        let (ops, _dir) = operations_with(transport).await;

        let accepted = ops
            .send(
                "a@x.test",
                "a@x.test",
                &["b@y.test".to_string()],
                b"From: a@x.test\r\n\r\nhi\r\n",
                &sample_message(),
            )
            .await
            .unwrap();

        assert!(accepted);
    }

    #[tokio::test]
    async fn delete_is_not_fatal_on_412() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(Method::DELETE, "/messages/m1", 412, Vec::new());
        let (ops, _dir) = operations_with(transport).await;

        let result = ops.delete("a@x.test", "m1", "etag").await.unwrap();
        assert!(!result);
    }
}
