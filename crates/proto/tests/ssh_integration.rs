//! Integration tests for SSH client-server communication.
//!
//! These tests run both ends over loopback TCP:
//! - Version exchange and Diffie-Hellman key exchange
//! - Authentication with fallback and the attempt limit
//! - Channel flow control and close semantics
//! - Rekeying with open channels
//! - AEAD ciphers end to end

use std::sync::Arc;

use tidewire_platform::{TidewireError, TidewireResult};
use tidewire_proto::ssh::auth::{ClientAuthMethod, StaticAuthenticator, StaticPassword};
use tidewire_proto::ssh::channel::ChannelConfig;
use tidewire_proto::ssh::client::{connect_tcp, SshClient, SshClientConfig};
use tidewire_proto::ssh::crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
use tidewire_proto::ssh::hostkey::{Ed25519HostKey, HostKey, HostKeyAlgorithm};
use tidewire_proto::ssh::kex::{AlgorithmPreferences, KexAlgorithm};
use tidewire_proto::ssh::known_hosts::{AcceptAnyHostKey, KnownHosts, StrictHostKeyChecking};
use tidewire_proto::ssh::server::{ServerConnection, SshServer, SshServerConfig};
use tidewire_proto::ssh::session::SessionEvent;
use tidewire_proto::ssh::transport::{HostId, Transport, TransportConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const LIMIT: Duration = Duration::from_secs(10);

fn server_config(host_key: Arc<dyn HostKey>) -> SshServerConfig {
    SshServerConfig {
        host_keys: vec![host_key],
        auth_failure_delay: Duration::from_millis(1),
        ..SshServerConfig::default()
    }
}

fn password_client(user: &str, password: &str) -> SshClientConfig {
    SshClientConfig::new(user)
        .with_verifier(Arc::new(AcceptAnyHostKey))
        .with_auth_method(ClientAuthMethod::Password(Arc::new(StaticPassword::new(password))))
}

/// Binds a server and accepts exactly one connection in the background.
async fn serve_one(
    config: SshServerConfig,
    auth: StaticAuthenticator,
) -> TidewireResult<(String, JoinHandle<TidewireResult<ServerConnection>>)> {
    let server = SshServer::bind("127.0.0.1:0", config, Arc::new(auth)).await?;
    let addr = server.local_addr()?.to_string();
    let handle = tokio::spawn(async move { server.accept().await });
    Ok((addr, handle))
}

async fn connected_pair(
    password: &str,
) -> Result<(SshClient, ServerConnection), Box<dyn std::error::Error>> {
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);
    let auth = StaticAuthenticator::new().with_password("alice", "secret");
    let (addr, server) = serve_one(server_config(host_key), auth).await?;
    let client = timeout(LIMIT, connect_tcp(&addr, password_client("alice", password))).await??;
    let conn = timeout(LIMIT, server).await???;
    Ok((client, conn))
}

fn single_algorithm_config() -> TransportConfig {
    TransportConfig {
        software_version: "Test".to_string(),
        preferences: AlgorithmPreferences {
            kex: vec![KexAlgorithm::DiffieHellmanGroup1Sha1],
            host_key: vec![HostKeyAlgorithm::SshEd25519],
            cipher: vec![CipherAlgorithm::Aes128Ctr],
            mac: vec![MacAlgorithm::HmacSha1],
            compression: vec![CompressionAlgorithm::None],
        },
        ..TransportConfig::default()
    }
}

/// Both sides of a group1 exchange derive the same session id and keys.
#[tokio::test]
async fn test_dh_group1_keys_agree() -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        Transport::accept(stream, single_algorithm_config(), vec![host_key]).await
    });
    let stream = TcpStream::connect(addr).await?;
    let client = timeout(
        LIMIT,
        Transport::connect(stream, single_algorithm_config(), Arc::new(AcceptAnyHostKey)),
    )
    .await??;
    let server = timeout(LIMIT, server).await???;

    assert_eq!(client.peer_version().to_string(), "SSH-2.0-Test");
    assert_eq!(server.peer_version().to_string(), "SSH-2.0-Test");
    assert_eq!(
        client.negotiated_algorithms().map(|n| n.kex),
        Some(KexAlgorithm::DiffieHellmanGroup1Sha1)
    );

    let session_id = client.session_id().ok_or("no session id")?;
    assert_eq!(Some(session_id.clone()), server.session_id());
    assert_eq!(session_id.len(), 20);

    let (c2s, s2c) = client.session_keys().ok_or("no client keys")?;
    let (server_c2s, server_s2c) = server.session_keys().ok_or("no server keys")?;
    for (ours, theirs) in [(&c2s, &server_c2s), (&s2c, &server_s2c)] {
        assert_eq!(ours.iv, theirs.iv);
        assert_eq!(ours.encryption_key, theirs.encryption_key);
        assert_eq!(ours.mac_key, theirs.mac_key);
    }
    assert_eq!(c2s.encryption_key.len(), 16);
    assert_eq!(c2s.mac_key.len(), 20);
    assert_ne!(c2s.encryption_key, s2c.encryption_key);

    client.disconnect().await;
    Ok(())
}

/// A 40000 byte send into a 32768 byte window arrives complete.
#[tokio::test]
async fn test_send_larger_than_window() -> Result<(), Box<dyn std::error::Error>> {
    let (client, mut conn) = connected_pair("secret").await?;
    let config = ChannelConfig {
        window_size: 32768,
        max_packet_size: 16384,
    };
    let channel = client
        .connection()
        .open_with_config("session", &[], config)
        .await?;
    assert!(channel.send_channel_request("shell", true, &[]).await?);

    let Some(SessionEvent::Shell { channel: remote }) = timeout(LIMIT, conn.next_event()).await?
    else {
        return Err("expected shell request".into());
    };
    assert_eq!(remote.remote_window(), 32768);

    let payload: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
    let sender = {
        let payload = payload.clone();
        let remote = remote.clone();
        tokio::spawn(async move { remote.send(&payload).await })
    };

    let received = timeout(LIMIT, channel.read_exact(40000)).await??;
    timeout(LIMIT, sender).await???;
    assert_eq!(received, payload);

    client.disconnect().await;
    Ok(())
}

/// Each AEAD cipher carries a session and a 40000 byte transfer.
#[tokio::test]
async fn test_aead_ciphers_carry_channel_data() -> Result<(), Box<dyn std::error::Error>> {
    for cipher in [
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::Aes128Gcm,
    ] {
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);
        let mut config = server_config(host_key);
        config.transport.preferences.cipher = vec![cipher];
        let auth = StaticAuthenticator::new().with_password("alice", "secret");
        let (addr, server) = serve_one(config, auth).await?;
        let client = timeout(LIMIT, connect_tcp(&addr, password_client("alice", "secret"))).await??;
        let mut conn = timeout(LIMIT, server).await???;

        let negotiated = client
            .transport()
            .negotiated_algorithms()
            .ok_or("no algorithms")?;
        assert_eq!(negotiated.cipher_client_to_server, cipher);
        assert_eq!(negotiated.cipher_server_to_client, cipher);
        assert_eq!(negotiated.mac_client_to_server, MacAlgorithm::None);

        let session = client.open_session().await?;
        assert!(session.exec("cat").await?);
        let Some(SessionEvent::Exec { channel: remote, .. }) =
            timeout(LIMIT, conn.next_event()).await?
        else {
            return Err("expected exec request".into());
        };

        let payload: Vec<u8> = (0..40000u32).map(|i| (i % 239) as u8).collect();
        let sender = {
            let payload = payload.clone();
            tokio::spawn(async move { remote.send(&payload).await })
        };
        let received = timeout(LIMIT, session.channel().read_exact(40000)).await??;
        timeout(LIMIT, sender).await???;
        assert_eq!(received, payload, "{}", cipher.name());

        client.disconnect().await;
    }
    Ok(())
}

/// Closing a channel releases a reader blocked in read_exact.
#[tokio::test]
async fn test_close_wakes_read_exact() -> Result<(), Box<dyn std::error::Error>> {
    let (client, mut conn) = connected_pair("secret").await?;
    let session = client.open_session().await?;
    assert!(session.exec("cat").await?);
    let Some(SessionEvent::Exec { channel: remote, .. }) = timeout(LIMIT, conn.next_event()).await?
    else {
        return Err("expected exec request".into());
    };

    let reader = {
        let channel = session.channel().clone();
        tokio::spawn(async move { channel.read_exact(1000).await })
    };
    remote.send(b"partial").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    remote.close().await?;

    let data = timeout(LIMIT, reader).await???;
    assert_eq!(data, b"partial");
    assert!(session.channel().is_eof());

    client.disconnect().await;
    Ok(())
}

/// An unknown key falls through to password authentication.
#[tokio::test]
async fn test_publickey_then_password() -> Result<(), Box<dyn std::error::Error>> {
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);
    let trusted: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);
    let unknown: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);

    let auth = StaticAuthenticator::new()
        .with_password("bob", "hunter2")
        .with_public_key("carol", trusted.as_ref());
    let (addr, server) = serve_one(server_config(host_key.clone()), auth).await?;

    let config = SshClientConfig::new("bob")
        .with_verifier(Arc::new(AcceptAnyHostKey))
        .with_auth_method(ClientAuthMethod::PublicKey(vec![unknown, trusted]))
        .with_auth_method(ClientAuthMethod::Password(Arc::new(StaticPassword::new("hunter2"))));
    let client = timeout(LIMIT, connect_tcp(&addr, config)).await??;
    let conn = timeout(LIMIT, server).await???;

    assert_eq!(client.user(), "bob");
    assert_eq!(conn.user(), "bob");
    client.disconnect().await;
    Ok(())
}

/// The server disconnects once the attempt limit is spent.
#[tokio::test]
async fn test_auth_attempt_limit() -> Result<(), Box<dyn std::error::Error>> {
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);
    let mut config = server_config(host_key);
    config.max_auth_attempts = 2;
    let auth = StaticAuthenticator::new().with_password("dave", "right");
    let (addr, server) = serve_one(config, auth).await?;

    let mut client_config = password_client("dave", "wrong1");
    for guess in ["wrong2", "wrong3"] {
        client_config = client_config
            .with_auth_method(ClientAuthMethod::Password(Arc::new(StaticPassword::new(guess))));
    }
    let client_err = timeout(LIMIT, connect_tcp(&addr, client_config))
        .await?
        .expect_err("authentication must fail");
    let server_err = timeout(LIMIT, server).await??.expect_err("server must refuse");

    assert_eq!(server_err.disconnect_reason(), Some(14));
    assert!(matches!(
        client_err,
        TidewireError::Disconnect { reason: 14, .. }
            | TidewireError::ConnectionLost(_)
            | TidewireError::Io(_)
    ));
    Ok(())
}

/// Host key checking against a known-hosts table.
#[tokio::test]
async fn test_known_hosts() -> Result<(), Box<dyn std::error::Error>> {
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);
    let server = SshServer::bind(
        "127.0.0.1:0",
        server_config(host_key.clone()),
        Arc::new(StaticAuthenticator::new().with_password("erin", "pw")),
    )
    .await?;
    let addr = server.local_addr()?;
    let server = tokio::spawn(async move {
        let first = server.accept().await;
        let second = server.accept().await;
        (first, second)
    });

    // Nothing trusted yet.
    let strict = SshClientConfig::new("erin")
        .with_auth_method(ClientAuthMethod::Password(Arc::new(StaticPassword::new("pw"))));
    let err = timeout(LIMIT, connect_tcp(&addr.to_string(), strict.clone()))
        .await?
        .expect_err("unknown host must be rejected");
    assert_eq!(err.disconnect_reason(), Some(9));

    let known = KnownHosts::new(StrictHostKeyChecking::Yes);
    known.add(&HostId::new("127.0.0.1", addr.port()), host_key.as_ref());
    let trusted = strict.with_verifier(Arc::new(known));
    let client = timeout(LIMIT, connect_tcp(&addr.to_string(), trusted)).await??;
    assert_eq!(
        client.transport().server_host_key().map(|k| k.public_key_bytes()),
        Some(host_key.public_key_bytes())
    );

    let (first, second) = timeout(LIMIT, server).await??;
    assert!(first.is_err());
    assert!(second.is_ok());
    client.disconnect().await;
    Ok(())
}

/// Channels keep working across a key exchange.
#[tokio::test]
async fn test_rekey_with_open_channel() -> Result<(), Box<dyn std::error::Error>> {
    let (client, mut conn) = connected_pair("secret").await?;
    let session = client.open_session().await?;
    assert!(session.shell().await?);
    let Some(SessionEvent::Shell { channel: remote }) = timeout(LIMIT, conn.next_event()).await?
    else {
        return Err("expected shell request".into());
    };

    let session_id = client.transport().session_id();
    session.channel().send(b"before").await?;
    timeout(LIMIT, client.transport().rekey()).await??;
    session.channel().send(b" after").await?;

    assert_eq!(timeout(LIMIT, remote.read_exact(12)).await??, b"before after");
    assert_eq!(client.transport().completed_exchanges(), 2);
    assert_eq!(client.transport().session_id(), session_id);
    assert_eq!(conn.transport().session_id(), session_id);

    client.disconnect().await;
    Ok(())
}
