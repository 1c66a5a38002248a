// tests/common/mod.rs
pub use axum::Router;
pub use serde_json::json;
pub use tokio::task::JoinHandle;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use reqwest::Client;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::resilience::retry::RetrySettings;
use crate::sources::authenticator::Authenticator;
use crate::sources::discovery::{DiscoveryClient, SmartConfiguration};
use crate::sources::signer::KeySigner;

pub const CLIENT_ID: &str = "test_client_id";
pub const TEST_JKU: &str = "https://test.com/jwks.json";
pub const TEST_KID: &str = "rsa_test_key";

/// Spawn an Axum router on an ephemeral port and return (JoinHandle, SocketAddr)
pub async fn spawn_axum(router: Router) -> (JoinHandle<()>, SocketAddr) {
    spawn_axum_with(|_| router).await
}

/// Like [`spawn_axum`], for routers that need their own address
/// (e.g. a discovery document pointing back at the same server).
pub async fn spawn_axum_with<F>(build: F) -> (JoinHandle<()>, SocketAddr)
where
    F: FnOnce(SocketAddr) -> Router,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().unwrap();
    let router = build(addr);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server failed");
    });
    (handle, addr)
}

pub fn build_reqwest_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("reqwest client")
}

pub fn fast_retry() -> RetrySettings {
    RetrySettings {
        attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

pub struct TestKeys {
    pub private_pem: String,
    pub public_pem: String,
    /// RSA private JWK json with kid "test-jwk-kid"
    pub private_jwk: String,
}

/// One RSA key pair per test binary; generation is slow.
pub fn test_keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate rsa key");
        let public = RsaPublicKey::from(&private);

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode private pem")
            .as_str()
            .to_owned();
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .expect("encode public pem");

        let b64 = |bytes: Vec<u8>| URL_SAFE_NO_PAD.encode(bytes);
        let primes = private.primes();
        let private_jwk = json!({
            "kty": "RSA",
            "kid": "test-jwk-kid",
            "alg": "RS384",
            "n": b64(private.n().to_bytes_be()),
            "e": b64(private.e().to_bytes_be()),
            "d": b64(private.d().to_bytes_be()),
            "p": b64(primes[0].to_bytes_be()),
            "q": b64(primes[1].to_bytes_be()),
        })
        .to_string();

        TestKeys {
            private_pem,
            public_pem,
            private_jwk,
        }
    })
}

pub fn test_signer() -> KeySigner {
    KeySigner::new(
        CLIENT_ID,
        &test_keys().private_pem,
        Some(TEST_JKU.to_owned()),
        Some(TEST_KID.to_owned()),
    )
    .expect("test signer")
}

/// Authenticator whose discovery is pinned to `token_endpoint`.
pub async fn test_authenticator(base_url: &str, token_endpoint: &str) -> Authenticator {
    let client = build_reqwest_client();
    let discovery = DiscoveryClient::new(client.clone(), base_url, Duration::from_secs(1));
    discovery
        .override_with(SmartConfiguration {
            token_endpoint: token_endpoint.to_owned(),
            authorization_endpoint: None,
            extra: Default::default(),
        })
        .await;
    Authenticator::new(
        client,
        Arc::new(discovery),
        test_signer(),
        vec!["system/Group.read".to_owned()],
    )
}

/// Successful token response body.
pub fn token_body(access_token: &str, expires_in: u64) -> serde_json::Value {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": expires_in,
        "scope": "system/Group.read",
    })
}
