use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use base64ct::Encoding;
use tracing::{debug, error, trace, warn};

use crate::credentials::CredentialVerifier;
use crate::mailbox::{Descriptor, MailboxOperations};

#[derive(Debug)]
pub enum Command {
    User(String),
    Pass(String),
    Auth(Option<String>),
    Capa,
    Stat,
    List(Option<usize>),
    Uidl(Option<usize>),
    Retr(usize),
    Top(usize, usize),
    Dele(usize),
    Rset,
    Noop,
    Quit,
    Stls,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default().to_ascii_uppercase();

    match verb.as_str() {
        "USER" => Command::User(parts.next().unwrap_or_default().to_string()),
        "PASS" => Command::Pass(parts.next().unwrap_or_default().to_string()),
        "AUTH" => Command::Auth(parts.next().map(str::to_string)),
        "CAPA" => Command::Capa,
        "STAT" => Command::Stat,
        "LIST" => Command::List(parts.next().and_then(|n| n.parse().ok())),
        "UIDL" => Command::Uidl(parts.next().and_then(|n| n.parse().ok())),
        "RETR" => match parts.next().and_then(|n| n.parse().ok()) {
            Some(n) => Command::Retr(n),
            None => Command::Unknown(line.to_string()),
        },
        "TOP" => {
            let n = parts.next().and_then(|n| n.parse().ok());
            let lines = parts.next().and_then(|n| n.parse().ok());
            match (n, lines) {
                (Some(n), Some(lines)) => Command::Top(n, lines),
                _ => Command::Unknown(line.to_string()),
            }
        }
        "DELE" => match parts.next().and_then(|n| n.parse().ok()) {
            Some(n) => Command::Dele(n),
            None => Command::Unknown(line.to_string()),
        },
        "RSET" => Command::Rset,
        "NOOP" => Command::Noop,
        "QUIT" => Command::Quit,
        "STLS" => Command::Stls,
        _ => Command::Unknown(line.to_string()),
    }
}

pub enum PopReply {
    Single(String),
    Multi(Vec<String>),
    StartTls(String),
    AuthContinuation(String),
    Stop(String),
}

enum PendingAuth {
    Plain,
    LoginUsername,
    LoginPassword(String),
}

enum State {
    Authorization { username: Option<String> },
    Transaction(Mailbox),
}

struct Mailbox {
    address: String,
    descriptors: Vec<Descriptor>,
    deleted: HashSet<usize>,
    body_cache: HashMap<usize, Vec<u8>>,
}

/// Implements the POP3 state machine from §4.9: Authorization, Transaction,
/// and the deletions applied at QUIT (Update).
pub struct Pop3Session {
    credentials: Arc<CredentialVerifier>,
    mailbox_ops: Arc<MailboxOperations>,

    peer_addr: SocketAddr,
    state: State,
    tls_active: bool,
    stls_available: bool,
    pending_auth: Option<PendingAuth>,
}

impl Pop3Session {
    pub fn new(
        peer_addr: SocketAddr,
        credentials: Arc<CredentialVerifier>,
        mailbox_ops: Arc<MailboxOperations>,
        tls_active: bool,
        stls_available: bool,
    ) -> Self {
        Self {
            credentials,
            mailbox_ops,
            peer_addr,
            state: State::Authorization { username: None },
            tls_active,
            stls_available,
            pending_auth: None,
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
        self.stls_available = false;
    }

    fn mailbox(&self) -> Option<&Mailbox> {
        match &self.state {
            State::Transaction(mailbox) => Some(mailbox),
            State::Authorization { .. } => None,
        }
    }

    fn not_in_transaction() -> PopReply {
        PopReply::Single("-ERR command not valid in this state".into())
    }

    pub async fn handle(&mut self, command: Command) -> PopReply {
        match command {
            Command::Capa => {
                let mut lines = vec!["USER".to_string(), "UIDL".to_string(), "TOP".to_string(), "PIPELINING".to_string()];
                if self.stls_available && !self.tls_active {
                    lines.push("STLS".to_string());
                }
                PopReply::Multi(lines)
            }
            Command::Stls => {
                if self.tls_active {
                    PopReply::Single("-ERR already using TLS".into())
                } else if !self.stls_available {
                    PopReply::Single("-ERR STLS not available".into())
                } else {
                    PopReply::StartTls("+OK begin TLS negotiation".into())
                }
            }
            Command::User(username) => match &self.state {
                State::Authorization { .. } => {
                    self.state = State::Authorization {
                        username: Some(username.to_lowercase()),
                    };
                    PopReply::Single("+OK".into())
                }
                State::Transaction(_) => PopReply::Single("-ERR already authenticated".into()),
            },
            Command::Pass(password) => match &self.state {
                State::Authorization { username: Some(username) } => {
                    let username = username.clone();
                    self.complete_login(&username, &password).await
                }
                State::Authorization { username: None } => {
                    PopReply::Single("-ERR send USER first".into())
                }
                State::Transaction(_) => PopReply::Single("-ERR already authenticated".into()),
            },
            Command::Auth(mechanism) => {
                if matches!(self.state, State::Transaction(_)) {
                    return PopReply::Single("-ERR already authenticated".into());
                }
                if !self.tls_active {
                    warn!(
                        "accepting credentials over an unencrypted connection from {}",
                        self.peer_addr
                    );
                }
                match mechanism.as_deref().map(str::to_ascii_uppercase).as_deref() {
                    Some("PLAIN") => {
                        self.pending_auth = Some(PendingAuth::Plain);
                        PopReply::AuthContinuation("+ ".into())
                    }
                    Some("LOGIN") => {
                        self.pending_auth = Some(PendingAuth::LoginUsername);
                        PopReply::AuthContinuation(format!(
                            "+ {}",
                            base64ct::Base64::encode_string(b"Username:")
                        ))
                    }
                    _ => PopReply::Single("-ERR unsupported authentication mechanism".into()),
                }
            }
            Command::Stat => match self.mailbox() {
                Some(mailbox) => {
                    let (count, size) = mailbox_totals(mailbox);
                    PopReply::Single(format!("+OK {count} {size}"))
                }
                None => Self::not_in_transaction(),
            },
            Command::List(arg) => match self.mailbox() {
                Some(mailbox) => list_reply(mailbox, arg),
                None => Self::not_in_transaction(),
            },
            Command::Uidl(arg) => match self.mailbox() {
                Some(mailbox) => uidl_reply(mailbox, arg),
                None => Self::not_in_transaction(),
            },
            Command::Retr(index) => self.retr(index).await,
            Command::Top(index, lines) => self.top(index, lines).await,
            Command::Dele(index) => self.dele(index),
            Command::Rset => match &mut self.state {
                State::Transaction(mailbox) => {
                    mailbox.deleted.clear();
                    PopReply::Single("+OK".into())
                }
                State::Authorization { .. } => Self::not_in_transaction(),
            },
            Command::Noop => PopReply::Single("+OK".into()),
            Command::Quit => self.quit().await,
            Command::Unknown(line) => {
                debug!("unrecognized POP3 command: {line}");
                PopReply::Single("-ERR unrecognized command".into())
            }
        }
    }

    pub async fn handle_auth_continuation(&mut self, line: &str) -> PopReply {
        let line = line.trim_end_matches(['\r', '\n']);

        match self.pending_auth.take() {
            Some(PendingAuth::Plain) => match decode_base64(line) {
                Some(decoded) => match parse_plain(&decoded) {
                    Some((username, password)) => self.complete_login(&username, &password).await,
                    None => PopReply::Single("-ERR syntax error".into()),
                },
                None => PopReply::Single("-ERR syntax error".into()),
            },
            Some(PendingAuth::LoginUsername) => match decode_base64(line) {
                Some(username) => {
                    self.pending_auth = Some(PendingAuth::LoginPassword(username.to_lowercase()));
                    PopReply::AuthContinuation(format!(
                        "+ {}",
                        base64ct::Base64::encode_string(b"Password:")
                    ))
                }
                None => PopReply::Single("-ERR syntax error".into()),
            },
            Some(PendingAuth::LoginPassword(username)) => match decode_base64(line) {
                Some(password) => self.complete_login(&username, &password).await,
                None => PopReply::Single("-ERR syntax error".into()),
            },
            None => PopReply::Single("-ERR bad sequence of commands".into()),
        }
    }

    async fn complete_login(&mut self, username: &str, password: &str) -> PopReply {
        if !self.credentials.check(username, password) {
            self.state = State::Authorization { username: None };
            return PopReply::Single("-ERR authentication failed".into());
        }

        match self.mailbox_ops.list(username).await {
            Ok(descriptors) => {
                trace!("session for {username} lists {} message(s)", descriptors.len());
                self.state = State::Transaction(Mailbox {
                    address: username.to_string(),
                    descriptors,
                    deleted: HashSet::new(),
                    body_cache: HashMap::new(),
                });
                PopReply::Single(format!("+OK {username} ready"))
            }
            Err(err) => {
                error!("failed to list mailbox for {username}: {err}");
                PopReply::Single("-ERR temporarily unavailable".into())
            }
        }
    }

    async fn retr(&mut self, index: usize) -> PopReply {
        let Some(raw) = self.fetch_body(index).await else {
            return PopReply::Single("-ERR no such message".into());
        };

        let mut lines = vec!["+OK message follows".to_string()];
        lines.extend(dot_stuffed_lines(&raw));
        PopReply::Multi(lines)
    }

    async fn top(&mut self, index: usize, lines: usize) -> PopReply {
        let Some(raw) = self.fetch_body(index).await else {
            return PopReply::Single("-ERR no such message".into());
        };

        let text = String::from_utf8_lossy(&raw);
        let mut header_and_body = text.splitn(2, "\r\n\r\n");
        let header = header_and_body.next().unwrap_or_default();
        let body = header_and_body.next().unwrap_or_default();

        let mut excerpt = String::new();
        excerpt.push_str(header);
        excerpt.push_str("\r\n\r\n");
        for line in body.split("\r\n").take(lines) {
            excerpt.push_str(line);
            excerpt.push_str("\r\n");
        }

        let mut lines = vec!["+OK top of message follows".to_string()];
        lines.extend(dot_stuffed_lines(excerpt.as_bytes()));
        PopReply::Multi(lines)
    }

    async fn fetch_body(&mut self, index: usize) -> Option<Vec<u8>> {
        let State::Transaction(mailbox) = &mut self.state else {
            return None;
        };

        if index == 0 || index > mailbox.descriptors.len() || mailbox.deleted.contains(&index) {
            return None;
        }

        if let Some(cached) = mailbox.body_cache.get(&index) {
            return Some(cached.clone());
        }

        let id = mailbox.descriptors[index - 1].id.clone();
        let address = mailbox.address.clone();
        drop(mailbox);

        match self.mailbox_ops.fetch_raw(&address, &id).await {
            Ok(Some(raw)) => {
                if let State::Transaction(mailbox) = &mut self.state {
                    mailbox.body_cache.insert(index, raw.clone());
                }
                Some(raw)
            }
            Ok(None) => None,
            Err(err) => {
                error!("failed to fetch message {id} for {address}: {err}");
                None
            }
        }
    }

    fn dele(&mut self, index: usize) -> PopReply {
        match &mut self.state {
            State::Transaction(mailbox) => {
                if index == 0 || index > mailbox.descriptors.len() {
                    PopReply::Single("-ERR no such message".into())
                } else if !mailbox.deleted.insert(index) {
                    PopReply::Single("-ERR message already deleted".into())
                } else {
                    PopReply::Single("+OK message deleted".into())
                }
            }
            State::Authorization { .. } => Self::not_in_transaction(),
        }
    }

    async fn quit(&mut self) -> PopReply {
        if let State::Transaction(mailbox) = &self.state {
            for &index in &mailbox.deleted {
                let descriptor = &mailbox.descriptors[index - 1];
                match self
                    .mailbox_ops
                    .delete(&mailbox.address, &descriptor.id, &descriptor.etag)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        "deletion of message {} for {} did not apply",
                        descriptor.id, mailbox.address
                    ),
                    Err(err) => error!(
                        "failed to delete message {} for {}: {err}",
                        descriptor.id, mailbox.address
                    ),
                }
            }
        }

        PopReply::Stop("+OK Bye".into())
    }
}

fn mailbox_totals(mailbox: &Mailbox) -> (usize, u64) {
    mailbox
        .descriptors
        .iter()
        .enumerate()
        .filter(|(i, _)| !mailbox.deleted.contains(&(i + 1)))
        .fold((0usize, 0u64), |(count, size), (_, d)| (count + 1, size + d.size))
}

fn list_reply(mailbox: &Mailbox, arg: Option<usize>) -> PopReply {
    match arg {
        Some(index) => {
            if index == 0 || index > mailbox.descriptors.len() || mailbox.deleted.contains(&index)
            {
                PopReply::Single("-ERR no such message".into())
            } else {
                PopReply::Single(format!("+OK {index} {}", mailbox.descriptors[index - 1].size))
            }
        }
        None => {
            let (count, size) = mailbox_totals(mailbox);
            let mut lines = vec![format!("+OK {count} messages ({size} octets)")];
            for (i, descriptor) in mailbox.descriptors.iter().enumerate() {
                let index = i + 1;
                if !mailbox.deleted.contains(&index) {
                    lines.push(format!("{index} {}", descriptor.size));
                }
            }
            PopReply::Multi(lines)
        }
    }
}

fn uidl_reply(mailbox: &Mailbox, arg: Option<usize>) -> PopReply {
    match arg {
        Some(index) => {
            if index == 0 || index > mailbox.descriptors.len() || mailbox.deleted.contains(&index)
            {
                PopReply::Single("-ERR no such message".into())
            } else {
                PopReply::Single(format!("+OK {index} {}", mailbox.descriptors[index - 1].id))
            }
        }
        None => {
            let mut lines = vec!["+OK".to_string()];
            for (i, descriptor) in mailbox.descriptors.iter().enumerate() {
                let index = i + 1;
                if !mailbox.deleted.contains(&index) {
                    lines.push(format!("{index} {}", descriptor.id));
                }
            }
            PopReply::Multi(lines)
        }
    }
}

fn decode_base64(line: &str) -> Option<String> {
    let mut bytes = line.as_bytes().to_vec();
    let decoded = base64ct::Base64::decode_in_place(&mut bytes).ok()?;
    std::str::from_utf8(decoded).ok().map(str::to_string)
}

fn parse_plain(decoded: &str) -> Option<(String, String)> {
    let mut parts = decoded.split('\0');
    let _authcid = parts.next()?;
    let username = parts.next()?;
    let password = parts.next()?;
    Some((username.to_lowercase(), password.to_string()))
}

/// Dot-stuffs lines starting with `.` and appends the terminating `.` line,
/// per the POP3 multi-line response format used by RETR/TOP.
fn dot_stuffed_lines(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines: Vec<String> = text
        .split("\r\n")
        .map(|line| {
            if let Some(rest) = line.strip_prefix('.') {
                format!(".{rest}")
            } else {
                line.to_string()
            }
        })
        .collect();

    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.push(".".to_string());
    lines
}
