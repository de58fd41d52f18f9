use password_auth::verify_password;

use crate::config::MailboxConfig;

/// A single configured mailbox: the address clients authenticate as, and the
/// password hash checked against whatever they present.
pub struct MailboxRecord {
    pub address: String,
    password_hash: String,
}

/// Checks client-presented credentials against the configured mailboxes
/// (§4.7). A linear scan is appropriate: the mailbox count is always small.
pub struct CredentialVerifier {
    records: Vec<MailboxRecord>,
}

impl CredentialVerifier {
    pub fn new(mailboxes: &[MailboxConfig]) -> Self {
        let records = mailboxes
            .iter()
            .map(|m| MailboxRecord {
                address: m.username.to_lowercase(),
                password_hash: m.password.clone(),
            })
            .collect();
        Self { records }
    }

    pub fn check(&self, username: &str, password: &str) -> bool {
        let username = username.to_lowercase();
        self.records
            .iter()
            .find(|record| record.address == username)
            .is_some_and(|record| verify_password(password, &record.password_hash).is_ok())
    }

    pub fn is_known_mailbox(&self, address: &str) -> bool {
        let address = address.to_lowercase();
        self.records.iter().any(|record| record.address == address)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn verifier_with(address: &str, password: &str) -> CredentialVerifier {
        let hash = password_auth::generate_hash(password);
        CredentialVerifier::new(&[MailboxConfig {
            username: address.to_string(),
            password: hash,
        }])
    }

    #[test]
    fn accepts_matching_credentials_case_insensitively() {
        let verifier = verifier_with("a@x.test", "hunter2");
        assert!(verifier.check("A@X.TEST", "hunter2"));
    }

    #[test]
    fn rejects_wrong_password() {
        let verifier = verifier_with("a@x.test", "hunter2");
        assert!(!verifier.check("a@x.test", "wrong"));
    }

    #[test]
    fn rejects_unknown_username() {
        let verifier = verifier_with("a@x.test", "hunter2");
        assert!(!verifier.check("b@x.test", "hunter2"));
    }

    #[test]
    fn is_known_mailbox_is_case_insensitive() {
        let verifier = verifier_with("a@x.test", "hunter2");
        assert!(verifier.is_known_mailbox("A@x.Test"));
        assert!(!verifier.is_known_mailbox("b@x.test"));
    }
}
