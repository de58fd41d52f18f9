use base64ct::{Base64, Encoding};
use mail_parser::{Message, MessageParser, MimeHeaders};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("could not parse message as RFC 5322 mail")]
    Unparseable,
    #[error("attachments total {total} bytes, exceeding the {limit} byte limit")]
    AttachmentTooLarge { total: u64, limit: u64 },
}

/// The SMTP envelope built incrementally by the SMTP state machine.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub mail_from: String,
    pub rcpt_tos: Vec<String>,
    pub raw_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Html,
    Text,
}

#[derive(Debug, Clone)]
pub struct UpstreamBody {
    pub kind: BodyKind,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamAttachment {
    pub name: String,
    pub base64_content: String,
    pub inline: bool,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamMessage {
    pub subject: Option<String>,
    pub body: UpstreamBody,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attachments: Vec<UpstreamAttachment>,
}

pub fn parse(raw_bytes: &[u8]) -> Result<Message<'_>, TranslateError> {
    MessageParser::default()
        .parse(raw_bytes)
        .ok_or(TranslateError::Unparseable)
}

/// The address half of the `From:` header, lowercased, for the envelope/
/// header cross-check in §4.8.
pub fn sender_address(message: &Message) -> Option<String> {
    message
        .from()
        .and_then(|addr| addr.first())
        .and_then(|addr| addr.address())
        .map(|a| a.to_lowercase())
}

fn header_address_count(message: &Message, name: mail_parser::HeaderName) -> usize {
    message
        .header(name)
        .and_then(|value| value.as_address())
        .map(|addr| addr.iter().count())
        .unwrap_or(0)
}

/// Implements §4.4's recipient split: counts addresses in `To`/`Cc`/`Bcc`
/// headers and, if they sum to the envelope recipient count, assigns
/// envelope addresses to the three buckets in that proportion; otherwise all
/// envelope recipients become `To`.
fn split_recipients(message: &Message, rcpt_tos: &[String]) -> (Vec<String>, Vec<String>, Vec<String>) {
    let t = header_address_count(message, mail_parser::HeaderName::To);
    let c = header_address_count(message, mail_parser::HeaderName::Cc);
    let b = header_address_count(message, mail_parser::HeaderName::Bcc);

    if t + c + b == rcpt_tos.len() {
        let to = rcpt_tos[..t].to_vec();
        let cc = rcpt_tos[t..t + c].to_vec();
        let bcc = rcpt_tos[t + c..].to_vec();
        (to, cc, bcc)
    } else {
        (rcpt_tos.to_vec(), Vec::new(), Vec::new())
    }
}

fn extract_body(message: &Message) -> UpstreamBody {
    let html_count = message.html_body_count();
    let html = if html_count > 0 {
        message.body_html(html_count - 1)
    } else {
        None
    };

    if let Some(html) = html {
        return UpstreamBody {
            kind: BodyKind::Html,
            content: html.into_owned(),
        };
    }

    let text = message.body_text(0).map(|t| t.into_owned());
    UpstreamBody {
        kind: BodyKind::Text,
        content: text.unwrap_or_default(),
    }
}

fn extract_attachments(message: &Message) -> (Vec<UpstreamAttachment>, u64) {
    let mut attachments = Vec::new();
    let mut total_bytes: u64 = 0;

    for part in message.attachments() {
        let bytes = part.contents();
        total_bytes += bytes.len() as u64;

        let content_id = part
            .content_id()
            .map(|id| id.trim_matches(['<', '>']).to_string());

        let name = part
            .attachment_name()
            .map(str::to_string)
            .or_else(|| content_id.clone())
            .unwrap_or_else(|| "attachment".to_string());

        attachments.push(UpstreamAttachment {
            name,
            base64_content: Base64::encode_string(bytes),
            inline: content_id.is_some(),
            content_id,
        });
    }

    (attachments, total_bytes)
}

/// Translates a parsed message plus the SMTP envelope's recipients into the
/// upstream message representation (§4.4), enforcing the attachment size cap.
pub fn translate(
    message: &Message,
    rcpt_tos: &[String],
    attachment_limit_bytes: u64,
) -> Result<UpstreamMessage, TranslateError> {
    let (to, cc, bcc) = split_recipients(message, rcpt_tos);
    let body = extract_body(message);
    let (attachments, total_bytes) = extract_attachments(message);

    if total_bytes > attachment_limit_bytes {
        return Err(TranslateError::AttachmentTooLarge {
            total: total_bytes,
            limit: attachment_limit_bytes,
        });
    }

    Ok(UpstreamMessage {
        subject: message.subject().map(str::to_string),
        body,
        to,
        cc,
        bcc,
        attachments,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn envelope(raw: &str, rcpt_tos: Vec<&str>) -> (Vec<u8>, Vec<String>) {
        (
            raw.replace('\n', "\r\n").into_bytes(),
            rcpt_tos.into_iter().map(str::to_string).collect(),
        )
    }

    #[test]
    fn aligns_recipients_when_counts_match() {
        let (raw, rcpt_tos) = envelope(
            "From: a@x.test\nTo: b@y.test\nCc: c@y.test\nSubject: hi\n\nbody\n",
            vec!["b@y.test", "c@y.test"],
        );
        let message = parse(&raw).unwrap();
        let upstream = translate(&message, &rcpt_tos, 80 * 1024 * 1024).unwrap();
        assert_eq!(upstream.to, vec!["b@y.test"]);
        assert_eq!(upstream.cc, vec!["c@y.test"]);
        assert!(upstream.bcc.is_empty());
    }

    #[test]
    fn falls_back_to_to_on_mismatched_counts() {
        let (raw, rcpt_tos) = envelope(
            "From: a@x.test\nTo: b@y.test\nSubject: hi\n\nbody\n",
            vec!["b@y.test", "c@y.test", "d@y.test"],
        );
        let message = parse(&raw).unwrap();
        let upstream = translate(&message, &rcpt_tos, 80 * 1024 * 1024).unwrap();
        assert_eq!(upstream.to, rcpt_tos);
        assert!(upstream.cc.is_empty());
        assert!(upstream.bcc.is_empty());
    }

    #[test]
    fn html_body_wins_over_text() {
        let raw = "From: a@x.test\nTo: b@y.test\nSubject: hi\nContent-Type: multipart/alternative; boundary=b\n\n--b\nContent-Type: text/plain\n\nplain\n--b\nContent-Type: text/html\n\n<p>hi</p>\n--b--\n".replace('\n', "\r\n");
        let message = parse(raw.as_bytes()).unwrap();
        let upstream = translate(&message, &["b@y.test".to_string()], 80 * 1024 * 1024).unwrap();
        assert_eq!(upstream.body.kind, BodyKind::Html);
        assert_eq!(upstream.body.content, "<p>hi</p>");
    }

    #[test]
    fn attachment_is_base64_encoded_and_not_inline_without_content_id() {
        let raw = concat!(
            "From: a@x.test\r\n",
            "To: b@y.test\r\n",
            "Subject: hi\r\n",
            "Content-Type: multipart/mixed; boundary=b\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "hi\r\n",
            "--b\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Disposition: attachment; filename=\"r.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "cmVwb3J0IGJ5dGVz\r\n",
            "--b--\r\n",
        );
        let message = parse(raw.as_bytes()).unwrap();
        let upstream = translate(&message, &["b@y.test".to_string()], 80 * 1024 * 1024).unwrap();
        assert_eq!(upstream.attachments.len(), 1);
        let attachment = &upstream.attachments[0];
        assert_eq!(attachment.name, "r.pdf");
        assert!(!attachment.inline);
        assert!(attachment.content_id.is_none());
    }

    #[test]
    fn rejects_attachments_over_the_limit() {
        let raw = concat!(
            "From: a@x.test\r\n",
            "To: b@y.test\r\n",
            "Subject: hi\r\n",
            "Content-Type: multipart/mixed; boundary=b\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-Disposition: attachment; filename=\"big.bin\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "cmVwb3J0IGJ5dGVz\r\n",
            "--b--\r\n",
        );
        let message = parse(raw.as_bytes()).unwrap();
        let err = translate(&message, &["b@y.test".to_string()], 4).unwrap_err();
        assert!(matches!(err, TranslateError::AttachmentTooLarge { .. }));
    }
}
