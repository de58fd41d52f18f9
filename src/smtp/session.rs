use std::net::SocketAddr;
use std::sync::Arc;

use base64ct::Encoding;
use smtp_proto::{
    AUTH_LOGIN, AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES, EXT_START_TLS,
    EhloResponse, Request,
};
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::credentials::CredentialVerifier;
use crate::mailbox::MailboxOperations;

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    IngestAuthContinuation(u16, String),
    StartTls(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

/// A fully authenticated single-step challenge, or the second step of a
/// two-step AUTH LOGIN exchange holding the username decoded in the first.
enum PendingAuth {
    Plain,
    LoginUsername,
    LoginPassword(String),
}

struct Envelope {
    mail_from: String,
    rcpt_tos: Vec<String>,
    raw_data: Vec<u8>,
}

/// Implements the SMTP state machine from §4.8: greeting, EHLO/HELO,
/// optional STARTTLS, AUTH PLAIN/LOGIN, MAIL/RCPT/DATA, and the ordered
/// acceptance checks run once a message is fully received.
pub struct SmtpSession {
    config: Arc<Config>,
    credentials: Arc<CredentialVerifier>,
    mailbox_ops: Arc<MailboxOperations>,

    peer_addr: SocketAddr,
    peer_name: Option<String>,
    starttls_available: bool,
    tls_active: bool,
    authenticated_mailbox: Option<String>,
    pending_auth: Option<PendingAuth>,
    envelope: Option<Envelope>,

    max_body_size: u64,
}

const RESPONSE_OK: &str = "2.0.0 Ok";
const RESPONSE_BYE: &str = "2.0.0 Goodbye";
const RESPONSE_SYNTAX_ERROR: &str = "5.5.2 Syntax error";
const RESPONSE_AUTH_SUCCESS: &str = "2.7.0 Authentication succeeded.";
const RESPONSE_AUTH_ERROR: &str = "5.7.8 Authentication credentials invalid";
const RESPONSE_ALREADY_AUTHENTICATED: &str = "5.5.1 Already authenticated";
const RESPONSE_TLS_REQUIRED: &str = "5.7.1 Must issue a STARTTLS command first";
const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
const RESPONSE_STARTTLS_NOT_AVAILABLE: &str = "5.5.1 STARTTLS not available";
const RESPONSE_START_TLS: &str = "2.0.0 Ready to start TLS";
const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
const RESPONSE_NOVALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
const RESPONSE_INVALID_EMAIL: &str = "5.1.3 This email address is not valid";
const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
const RESPONSE_COMMAND_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";
const RESPONSE_MESSAGE_ACCEPTED: &str = "2.6.0 Message accepted";
const RESPONSE_MESSAGE_REJECTED: &str = "5.6.0 Message rejected";
const RESPONSE_TEMP_FAILURE: &str = "4.3.0 Temporarily unable to accept, try again later";
const RESPONSE_RECIPIENT_DOMAIN_DENIED: &str = "5.7.1 Recipient domain not allowed";
const RESPONSE_SENDER_MISMATCH: &str = "5.7.1 Envelope sender does not match the From header";
const RESPONSE_SENDER_NOT_ALLOWED: &str = "5.7.1 Sender is not a configured mailbox";

impl SmtpSession {
    pub fn new(
        peer_addr: SocketAddr,
        config: Arc<Config>,
        credentials: Arc<CredentialVerifier>,
        mailbox_ops: Arc<MailboxOperations>,
        tls_active: bool,
        starttls_available: bool,
    ) -> Self {
        let max_body_size = config.attachment_limit_mb * 1024 * 1024 + 2 * 1024 * 1024;
        Self {
            config,
            credentials,
            mailbox_ops,
            peer_addr,
            peer_name: None,
            starttls_available,
            tls_active,
            authenticated_mailbox: None,
            pending_auth: None,
            envelope: None,
            max_body_size,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    pub fn is_awaiting_auth_continuation(&self) -> bool {
        self.pending_auth.is_some()
    }

    pub fn mark_tls_active(&mut self) {
        self.tls_active = true;
        self.starttls_available = false;
    }

    fn requires_tls_before_auth(&self) -> bool {
        self.starttls_available && !self.tls_active
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");
                return SessionReply::ReplyAndContinue(554, e.to_string());
            }
        };

        if let Request::Auth { mechanism, .. } = request {
            trace!(
                "received AUTH with mechanism {mechanism} from {}",
                self.peer_addr
            );
        } else {
            trace!("received request: {request:?} from {}", self.peer_addr);
        }

        match request {
            Request::Ehlo { host } => {
                let mut response = EhloResponse::new(&host);
                response.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_AUTH;
                response.auth_mechanisms = AUTH_PLAIN | AUTH_LOGIN;
                if self.requires_tls_before_auth() {
                    response.capabilities |= EXT_START_TLS;
                }

                let mut buf = Vec::with_capacity(64);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);
                SessionReply::RawReply(buf)
            }
            Request::Lhlo { .. } => {
                SessionReply::ReplyAndContinue(502, RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Helo { .. } => {
                SessionReply::ReplyAndContinue(502, RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::StartTls => {
                if self.tls_active {
                    SessionReply::ReplyAndContinue(504, RESPONSE_ALREADY_TLS.into())
                } else if !self.starttls_available {
                    SessionReply::ReplyAndContinue(502, RESPONSE_STARTTLS_NOT_AVAILABLE.into())
                } else {
                    SessionReply::StartTls(220, RESPONSE_START_TLS.into())
                }
            }
            Request::Auth {
                mechanism,
                initial_response,
            } => {
                if self.authenticated_mailbox.is_some() {
                    return SessionReply::ReplyAndContinue(
                        503,
                        RESPONSE_ALREADY_AUTHENTICATED.into(),
                    );
                }
                if self.requires_tls_before_auth() {
                    warn!("rejecting AUTH attempt before STARTTLS from {}", self.peer_addr);
                    return SessionReply::ReplyAndContinue(530, RESPONSE_TLS_REQUIRED.into());
                }
                if !self.tls_active {
                    warn!(
                        "accepting credentials over an unencrypted connection from {}",
                        self.peer_addr
                    );
                }

                if mechanism == AUTH_PLAIN {
                    if initial_response.is_empty() {
                        self.pending_auth = Some(PendingAuth::Plain);
                        SessionReply::IngestAuthContinuation(334, String::new())
                    } else {
                        let (code, message) = self.verify_plain(initial_response.as_bytes());
                        SessionReply::ReplyAndContinue(code, message)
                    }
                } else if mechanism == AUTH_LOGIN {
                    self.pending_auth = Some(PendingAuth::LoginUsername);
                    SessionReply::IngestAuthContinuation(
                        334,
                        base64ct::Base64::encode_string(b"Username:"),
                    )
                } else {
                    debug!("received unsupported AUTH mechanism");
                    SessionReply::ReplyAndContinue(535, RESPONSE_AUTH_ERROR.into())
                }
            }
            Request::Quit => SessionReply::ReplyAndStop(221, RESPONSE_BYE.into()),
            _ if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, RESPONSE_HELLO_FIRST.into())
            }
            Request::Mail { from } => {
                debug!("received MAIL FROM: {}", from.address);

                let Ok(address) = from.address.parse::<email_address::EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(553, RESPONSE_INVALID_SENDER.into());
                };

                if self.envelope.is_some() {
                    return SessionReply::ReplyAndContinue(503, RESPONSE_NESTED_MAIL.into());
                }

                self.envelope = Some(Envelope {
                    mail_from: address.to_string().to_lowercase(),
                    rcpt_tos: Vec::new(),
                    raw_data: Vec::new(),
                });

                SessionReply::ReplyAndContinue(250, format!("2.1.0 Originator <{}> ok", from.address))
            }
            Request::Rcpt { to } => {
                debug!("received RCPT TO: {}", to.address);

                let Ok(address) = to.address.parse::<email_address::EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(553, RESPONSE_INVALID_EMAIL.into());
                };

                let Some(envelope) = self.envelope.as_mut() else {
                    return SessionReply::ReplyAndContinue(503, RESPONSE_MAIL_FIRST.into());
                };

                envelope.rcpt_tos.push(address.to_string().to_lowercase());
                SessionReply::ReplyAndContinue(250, format!("2.1.5 Recipient <{}> ok", to.address))
            }
            Request::Data => {
                let Some(envelope) = self.envelope.as_ref() else {
                    return SessionReply::ReplyAndContinue(503, RESPONSE_BAD_SEQUENCE.into());
                };

                if envelope.rcpt_tos.is_empty() {
                    return SessionReply::ReplyAndContinue(554, RESPONSE_NOVALID_RECIPIENTS.into());
                }

                SessionReply::IngestData(354, RESPONSE_START_DATA.into())
            }
            Request::Rset => {
                self.envelope = None;
                SessionReply::ReplyAndContinue(250, RESPONSE_OK.into())
            }
            Request::Noop { .. } => SessionReply::ReplyAndContinue(250, RESPONSE_OK.into()),
            Request::Vrfy { .. } => SessionReply::ReplyAndContinue(502, RESPONSE_NO_VRFY.into()),
            Request::Bdat { .. }
            | Request::Expn { .. }
            | Request::Help { .. }
            | Request::Etrn { .. }
            | Request::Atrn { .. }
            | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
        }
    }

    /// Routes a continuation line while `pending_auth` is set. Per the
    /// design notes in §9, no ordinary command parsing happens in this
    /// state: every line is treated strictly as the next AUTH step.
    pub fn handle_auth_continuation(&mut self, line: &mut [u8]) -> SessionReply {
        match self.pending_auth.take() {
            Some(PendingAuth::Plain) => {
                let (code, message) = self.verify_plain(line);
                SessionReply::ReplyAndContinue(code, message)
            }
            Some(PendingAuth::LoginUsername) => {
                let ascii_len = line.trim_ascii_end().len();
                match base64ct::Base64::decode_in_place(&mut line[..ascii_len])
                    .ok()
                    .and_then(|decoded| std::str::from_utf8(decoded).ok())
                {
                    Some(username) => {
                        self.pending_auth = Some(PendingAuth::LoginPassword(username.to_string()));
                        SessionReply::IngestAuthContinuation(
                            334,
                            base64ct::Base64::encode_string(b"Password:"),
                        )
                    }
                    None => SessionReply::ReplyAndContinue(501, RESPONSE_SYNTAX_ERROR.into()),
                }
            }
            Some(PendingAuth::LoginPassword(username)) => {
                let ascii_len = line.trim_ascii_end().len();
                let password = base64ct::Base64::decode_in_place(&mut line[..ascii_len])
                    .ok()
                    .and_then(|decoded| std::str::from_utf8(decoded).ok())
                    .map(str::to_string);

                match password {
                    Some(password) => {
                        let (code, message) = self.verify_credentials(&username, &password);
                        SessionReply::ReplyAndContinue(code, message)
                    }
                    None => SessionReply::ReplyAndContinue(501, RESPONSE_SYNTAX_ERROR.into()),
                }
            }
            None => SessionReply::ReplyAndContinue(503, RESPONSE_BAD_SEQUENCE.into()),
        }
    }

    fn verify_plain(&mut self, data: &[u8]) -> (u16, String) {
        let ascii_len = data.trim_ascii_end().len();
        let mut data = data[..ascii_len].to_vec();

        let Ok(decoded) = base64ct::Base64::decode_in_place(&mut data) else {
            return (501, RESPONSE_SYNTAX_ERROR.into());
        };

        let mut parts = decoded.split(|&b| b == 0);
        let Some(_authcid) = parts.next() else {
            return (501, RESPONSE_SYNTAX_ERROR.into());
        };
        let Some(username) = parts.next() else {
            return (501, RESPONSE_SYNTAX_ERROR.into());
        };
        let Some(password) = parts.next() else {
            return (501, RESPONSE_SYNTAX_ERROR.into());
        };
        if parts.next().is_some() {
            return (501, RESPONSE_SYNTAX_ERROR.into());
        }

        let (Ok(username), Ok(password)) = (
            std::str::from_utf8(username),
            std::str::from_utf8(password),
        ) else {
            return (501, RESPONSE_SYNTAX_ERROR.into());
        };

        self.verify_credentials(username, password)
    }

    fn verify_credentials(&mut self, username: &str, password: &str) -> (u16, String) {
        trace!("decoded credentials, username: {username} ({} chars)", password.len());

        if self.credentials.check(username, password) {
            self.authenticated_mailbox = Some(username.to_lowercase());
            (235, RESPONSE_AUTH_SUCCESS.into())
        } else {
            (535, RESPONSE_AUTH_ERROR.into())
        }
    }

    pub async fn handle_data(&mut self, chunk: &[u8]) -> DataReply {
        let Some(envelope) = self.envelope.as_mut() else {
            return DataReply::ReplyAndContinue(503, RESPONSE_BAD_SEQUENCE.into());
        };

        envelope.raw_data.extend_from_slice(chunk);

        if envelope.raw_data.len() as u64 > self.max_body_size {
            self.envelope = None;
            return DataReply::ReplyAndContinue(554, RESPONSE_MESSAGE_REJECTED.into());
        }

        const DATA_END: &[u8] = b"\r\n.\r\n";
        if !(envelope.raw_data.ends_with(DATA_END) || envelope.raw_data == &DATA_END[2..]) {
            return DataReply::ContinueIngest;
        }

        let mut envelope = self.envelope.take().expect("checked above");
        envelope
            .raw_data
            .truncate(envelope.raw_data.len() - DATA_END.len());

        trace!("received message ({} bytes)", envelope.raw_data.len());

        let (code, message) = self.finish_message(envelope).await;
        DataReply::ReplyAndContinue(code, message)
    }

    /// Runs the ordered acceptance checks from §4.8 once a full message has
    /// been read.
    async fn finish_message(&self, envelope: Envelope) -> (u16, String) {
        for rcpt in &envelope.rcpt_tos {
            let domain = rcpt.rsplit('@').next().unwrap_or_default();
            if !self.config.allows_domain(domain) {
                return (550, RESPONSE_RECIPIENT_DOMAIN_DENIED.into());
            }
        }

        let parsed = match crate::mail::parse(&envelope.raw_data) {
            Ok(parsed) => parsed,
            Err(_) => return (554, RESPONSE_MESSAGE_REJECTED.into()),
        };

        let header_from = crate::mail::sender_address(&parsed);
        if header_from.as_deref() != Some(envelope.mail_from.as_str()) {
            return (550, RESPONSE_SENDER_MISMATCH.into());
        }

        if !self.credentials.is_known_mailbox(&envelope.mail_from) {
            return (550, RESPONSE_SENDER_NOT_ALLOWED.into());
        }

        let attachment_limit = self.config.attachment_limit_mb * 1024 * 1024;
        let translated =
            match crate::mail::translate(&parsed, &envelope.rcpt_tos, attachment_limit) {
                Ok(translated) => translated,
                Err(crate::mail::TranslateError::AttachmentTooLarge { .. }) => {
                    return (552, "5.3.4 Message too large".into());
                }
                Err(crate::mail::TranslateError::Unparseable) => {
                    return (554, RESPONSE_MESSAGE_REJECTED.into());
                }
            };

        match self
            .mailbox_ops
            .send(
                &envelope.mail_from,
                &envelope.mail_from,
                &envelope.rcpt_tos,
                &envelope.raw_data,
                &translated,
            )
            .await
        {
            Ok(true) => (250, RESPONSE_MESSAGE_ACCEPTED.into()),
            Ok(false) => (451, RESPONSE_TEMP_FAILURE.into()),
            Err(err) => {
                error!("failed to send message: {err}");
                (451, RESPONSE_TEMP_FAILURE.into())
            }
        }
    }
}
