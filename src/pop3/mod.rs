mod connection;
pub mod server;
mod session;

pub use server::{Mode, Pop3Server, Pop3ServerError};

#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::sync::Arc;

    use http::Method;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::MailboxConfig;
    use crate::credentials::CredentialVerifier;
    use crate::mailbox::MailboxOperations;
    use crate::spool::Spool;
    use crate::token::{TokenBundle, TokenManager, TokenStore};
    use crate::upstream::UpstreamAdapter;
    use crate::upstream::mock::MockTransport;

    fn random_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn setup_server(
        transport: Arc<MockTransport>,
    ) -> (CancellationToken, JoinHandle<()>, u16, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let port = random_port();

        let mailboxes = vec![MailboxConfig {
            username: "john@example.com".into(),
            password: password_auth::generate_hash("p4ssw0rd"),
        }];
        let credentials = Arc::new(CredentialVerifier::new(&mailboxes));

        let store = TokenStore::new(dir.path().join("token.bin"), "client-id");
        let manager = Arc::new(TokenManager::new("client-id".into(), "tenant".into(), store));
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
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port));
        let server = Pop3Server::new(
            bind_addr,
            Mode::Plain { stls: None },
            credentials,
            mailbox_ops,
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move {
            server.serve().await.unwrap();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        (shutdown, handle, port, dir)
    }

    async fn read_reply(reader: &mut (impl AsyncBufReadExt + Unpin)) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn authorizes_and_lists_an_empty_mailbox() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(Method::GET, "/mailFolders/Inbox/messages", 200, br#"{"value":[]}"#.to_vec());
        let (shutdown, handle, port, _dir) = setup_server(transport).await;

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut reader = BufReader::new(stream);
        assert!(read_reply(&mut reader).await.starts_with("+OK"));

        reader.write_all(b"USER john@example.com\r\n").await.unwrap();
        assert!(read_reply(&mut reader).await.starts_with("+OK"));

        reader.write_all(b"PASS p4ssw0rd\r\n").await.unwrap();
        assert!(read_reply(&mut reader).await.starts_with("+OK"));

        reader.write_all(b"STAT\r\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await.trim(), "+OK 0 0");

        reader.write_all(b"QUIT\r\n").await.unwrap();
        assert!(read_reply(&mut reader).await.starts_with("+OK"));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn retr_returns_ok_status_line_then_dot_stuffed_body() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(
            Method::GET,
            "/mailFolders/Inbox/messages?$top=50",
            200,
            br#"{"value":[{"id":"m1"},{"id":"m2"}]}"#.to_vec(),
        );
        transport.push_response(
            Method::GET,
            "/messages/m1",
            200,
            br#"{"size":30,"hasAttachments":false}"#.to_vec(),
        );
        transport.push_response(
            Method::GET,
            "/messages/m2",
            200,
            br#"{"size":30,"hasAttachments":false}"#.to_vec(),
        );
        transport.push_response(
            Method::GET,
            "/messages/m2/$value",
            200,
            b"From: john@example.com\r\n\r\n.Leading dot\r\nbody\r\n".to_vec(),
        );
        let (shutdown, handle, port, _dir) = setup_server(transport).await;

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut reader = BufReader::new(stream);
        let _ = read_reply(&mut reader).await;

        reader.write_all(b"USER john@example.com\r\n").await.unwrap();
        let _ = read_reply(&mut reader).await;
        reader.write_all(b"PASS p4ssw0rd\r\n").await.unwrap();
        let _ = read_reply(&mut reader).await;

        reader.write_all(b"RETR 2\r\n").await.unwrap();
        let status = read_reply(&mut reader).await;
        assert!(status.starts_with("+OK"), "unexpected status line: {status:?}");

        let mut body_lines = Vec::new();
        loop {
            let line = read_reply(&mut reader).await;
            if line.trim_end_matches("\r\n") == "." {
                break;
            }
            body_lines.push(line);
        }

        assert_eq!(body_lines[0].trim_end(), "From: john@example.com");
        assert!(body_lines.iter().any(|l| l.trim_end() == "..Leading dot"));

        reader.write_all(b"QUIT\r\n").await.unwrap();
        let _ = read_reply(&mut reader).await;

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let transport = Arc::new(MockTransport::new());
        let (shutdown, handle, port, _dir) = setup_server(transport).await;

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut reader = BufReader::new(stream);
        let _ = read_reply(&mut reader).await;

        reader.write_all(b"USER john@example.com\r\n").await.unwrap();
        let _ = read_reply(&mut reader).await;

        reader.write_all(b"PASS wrong\r\n").await.unwrap();
        assert!(read_reply(&mut reader).await.starts_with("-ERR"));

        reader.write_all(b"QUIT\r\n").await.unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(reply.starts_with("+OK") || matches!(reply.as_str(), ""));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
