mod connection;
pub mod server;
mod session;

pub use server::{Mode, SmtpServer, SmtpServerError};

#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::sync::Arc;

    use mail_send::SmtpClientBuilder;
    use mail_send::mail_builder::MessageBuilder;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::{Config, MailboxConfig};
    use crate::credentials::CredentialVerifier;
    use crate::mailbox::MailboxOperations;
    use crate::spool::Spool;
    use crate::token::{TokenBundle, TokenManager, TokenStore};
    use crate::upstream::mock::MockTransport;
    use crate::upstream::UpstreamAdapter;

    fn random_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config() -> Config {
        Config {
            client_id: "client".into(),
            tenant_id: "tenant".into(),
            mailboxes: vec![MailboxConfig {
                username: "john@example.com".into(),
                password: password_auth::generate_hash("p4ssw0rd"),
            }],
            allowed_domains: vec!["example.com".into(), "test.com".into()],
            bind: "127.0.0.1".into(),
            smtp_port: None,
            pop3_port: None,
            smtps_port: None,
            pop3s_port: None,
            tls: None,
            token_path: "token.bin".into(),
            queue_dir: "queue".into(),
            attachment_limit_mb: 80,
            https_proxy: None,
            logging: None,
        }
    }

    async fn setup_server(
        transport: Arc<MockTransport>,
    ) -> (CancellationToken, JoinHandle<()>, u16, tempfile::TempDir) {
        let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
        let dir = tempfile::tempdir().unwrap();
        let smtp_port = random_port();

        let config = Arc::new(test_config());
        let credentials = Arc::new(CredentialVerifier::new(&config.mailboxes));

        let store = TokenStore::new(dir.path().join("token.bin"), &config.client_id);
        let manager = Arc::new(TokenManager::new(
            config.client_id.clone(),
            config.tenant_id.clone(),
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

        let adapter = Arc::new(UpstreamAdapter::new(transport, manager));
        let spool = Arc::new(Spool::new(dir.path().join("queue")).unwrap());
        let mailbox_ops = Arc::new(MailboxOperations::new(adapter, spool));

        let shutdown = CancellationToken::new();
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), smtp_port));

        let server = SmtpServer::new(
            bind_addr,
            Mode::Plain { starttls: None },
            "mailproxy.test".into(),
            config,
            credentials,
            mailbox_ops,
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move {
            server.serve().await.unwrap();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        (shutdown, handle, smtp_port, dir)
    }

    #[tokio::test]
    async fn accepts_and_sends_a_message_from_a_known_mailbox() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(http::Method::POST, "/sendMail", 202, Vec::new());
        let (shutdown, handle, port, _dir) = setup_server(transport).await;

        let message = MessageBuilder::new()
            .from(("John Doe", "john@example.com"))
            .to(vec![("Jane Doe", "jane@test.com")])
            .subject("Hi!")
            .text_body("Hello world!");

        SmtpClientBuilder::new("127.0.0.1", port)
            .implicit_tls(false)
            .credentials(("john@example.com", "p4ssw0rd"))
            .connect_plain()
            .await
            .unwrap()
            .send(message)
            .await
            .unwrap();

        shutdown.cancel();
        handle.await.unwrap();
    }

    /// §8 defines DATA acceptance purely in terms of the recipient domain,
    /// the envelope/header `From` match, and the header `From` being a
    /// configured mailbox — authentication is not one of the conditions, so
    /// an unauthenticated submission from an allowed mailbox must still be
    /// accepted.
    #[tokio::test]
    async fn accepts_an_unauthenticated_message_from_a_known_mailbox() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(http::Method::POST, "/sendMail", 202, Vec::new());
        let (shutdown, handle, port, _dir) = setup_server(transport).await;

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();

        reader.write_all(b"EHLO client.test\r\n").await.unwrap();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            if !line.starts_with("250-") {
                break;
            }
        }

        reader
            .write_all(b"MAIL FROM:<john@example.com>\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert!(reply.starts_with("250"), "unexpected MAIL reply: {reply:?}");

        reader
            .write_all(b"RCPT TO:<jane@test.com>\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert!(reply.starts_with("250"), "unexpected RCPT reply: {reply:?}");

        reader.write_all(b"DATA\r\n").await.unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert!(reply.starts_with("354"), "unexpected DATA reply: {reply:?}");

        reader
            .write_all(
                b"From: john@example.com\r\nTo: jane@test.com\r\nSubject: Hi\r\n\r\nHello\r\n.\r\n",
            )
            .await
            .unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert!(reply.starts_with("250"), "unexpected acceptance reply: {reply:?}");

        reader.write_all(b"QUIT\r\n").await.unwrap();

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_wrong_credentials() {
        let transport = Arc::new(MockTransport::new());
        let (shutdown, handle, port, _dir) = setup_server(transport).await;

        let result = SmtpClientBuilder::new("127.0.0.1", port)
            .implicit_tls(false)
            .credentials(("john@example.com", "wrong"))
            .connect_plain()
            .await;

        assert!(result.is_err());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
