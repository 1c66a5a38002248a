//! RS384 client assertions for the SMART backend-services grant.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::{BigUint, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::service::ASSERTION_TTL_MINUTES_DEFAULT;
use crate::error::{BulkError, BulkResult};
use crate::helpers::time::now_i64;

pub const ASSERTION_ALGORITHM: Algorithm = Algorithm::RS384;

/// Claims of a client assertion (RFC 7523).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Private half of the registered key pair.
#[derive(Clone)]
pub struct SigningKey {
    encoding_key: EncodingKey,
    /// kid embedded in a JWK, if the material was one
    embedded_kid: Option<String>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("embedded_kid", &self.embedded_kid)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct RsaPrivateJwk {
    kty: String,
    n: String,
    e: String,
    d: Option<String>,
    p: Option<String>,
    q: Option<String>,
    kid: Option<String>,
}

impl SigningKey {
    /// Accepts PEM (PKCS#1 or PKCS#8) or an RSA private JWK as JSON.
    pub fn from_material(material: &str) -> BulkResult<Self> {
        let material = material.trim();
        if material.is_empty() {
            return Err(BulkError::Signing("no private key material provided".to_owned()));
        }
        if material.starts_with('{') {
            Self::from_jwk(material)
        } else if material.starts_with("-----BEGIN") {
            Self::from_pem(material)
        } else {
            Err(BulkError::Signing(
                "private key must be PEM or a JWK json object".to_owned(),
            ))
        }
    }

    pub fn from_pem(pem: &str) -> BulkResult<Self> {
        RsaPrivateKey::from_pkcs8_pem(pem)
            .map(|_| ())
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem).map(|_| ()))
            .map_err(|e| BulkError::Signing(format!("invalid RSA private key pem: {}", e)))?;
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| BulkError::Signing(format!("invalid RSA pem: {}", e)))?;
        Ok(Self { encoding_key, embedded_kid: None })
    }

    pub fn from_jwk(json: &str) -> BulkResult<Self> {
        let jwk: RsaPrivateJwk = serde_json::from_str(json)
            .map_err(|e| BulkError::Signing(format!("invalid jwk: {}", e)))?;
        if jwk.kty != "RSA" {
            return Err(BulkError::Signing(format!("unsupported jwk kty '{}', expected RSA", jwk.kty)));
        }
        let missing = |name: &str| BulkError::Signing(format!("jwk is missing private member '{}'", name));
        let d = jwk.d.as_deref().ok_or_else(|| missing("d"))?;
        let p = jwk.p.as_deref().ok_or_else(|| missing("p"))?;
        let q = jwk.q.as_deref().ok_or_else(|| missing("q"))?;

        let private_key = RsaPrivateKey::from_components(
            jwk_uint("n", &jwk.n)?,
            jwk_uint("e", &jwk.e)?,
            jwk_uint("d", d)?,
            vec![jwk_uint("p", p)?, jwk_uint("q", q)?],
        )
        .map_err(|e| BulkError::Signing(format!("inconsistent RSA jwk: {}", e)))?;

        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| BulkError::Signing(format!("cannot encode jwk as pem: {}", e)))?;
        let mut key = Self::from_pem(&pem)?;
        key.embedded_kid = jwk.kid;
        Ok(key)
    }
}

fn jwk_uint(name: &str, value: &str) -> BulkResult<BigUint> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map(|bytes| BigUint::from_bytes_be(&bytes))
        .map_err(|e| BulkError::Signing(format!("jwk member '{}' is not base64url: {}", name, e)))
}

/// Signs client assertions on behalf of one registered client.
#[derive(Debug, Clone)]
pub struct KeySigner {
    key: SigningKey,
    client_id: String,
    jku: Option<String>,
    kid: Option<String>,
    ttl_minutes: u64,
}

impl KeySigner {
    pub fn new(
        client_id: impl Into<String>,
        key_material: &str,
        jku: Option<String>,
        kid: Option<String>,
    ) -> BulkResult<Self> {
        let client_id = client_id.into();
        if client_id.trim().is_empty() {
            return Err(BulkError::Signing("client id must not be empty".to_owned()));
        }
        let key = SigningKey::from_material(key_material)?;
        let kid = kid.or_else(|| key.embedded_kid.clone());
        Ok(Self {
            key,
            client_id,
            jku,
            kid,
            ttl_minutes: ASSERTION_TTL_MINUTES_DEFAULT,
        })
    }

    pub fn with_ttl_minutes(mut self, ttl_minutes: u64) -> Self {
        self.ttl_minutes = ttl_minutes;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Backend-services assertion: the client is both subject and issuer.
    pub fn sign_for(&self, audience: &str) -> BulkResult<String> {
        self.sign_assertion(audience, &self.client_id, &self.client_id, self.ttl_minutes)
    }

    /// Fresh `jti` and `iat` on every call.
    pub fn sign_assertion(
        &self,
        audience: &str,
        subject: &str,
        issuer: &str,
        ttl_minutes: u64,
    ) -> BulkResult<String> {
        let jti = Uuid::new_v4().simple().to_string();
        self.sign_assertion_at(audience, subject, issuer, ttl_minutes, now_i64(), &jti)
    }

    pub fn sign_assertion_at(
        &self,
        audience: &str,
        subject: &str,
        issuer: &str,
        ttl_minutes: u64,
        issued_at: i64,
        jti: &str,
    ) -> BulkResult<String> {
        let claims = AssertionClaims {
            sub: subject.to_owned(),
            iss: issuer.to_owned(),
            aud: audience.to_owned(),
            iat: issued_at,
            exp: assertion_expiry(issued_at, ttl_minutes),
            jti: jti.to_owned(),
        };

        let mut header = Header::new(ASSERTION_ALGORITHM);
        header.typ = Some("JWT".to_owned());
        header.kid = self.kid.clone();
        header.jku = self.jku.clone();

        encode(&header, &claims, &self.key.encoding_key)
            .map_err(|e| BulkError::Signing(format!("cannot sign assertion: {}", e)))
    }
}

/// `exp` claim for an assertion issued at `issued_at`, saturating on overflow.
fn assertion_expiry(issued_at: i64, ttl_minutes: u64) -> i64 {
    i64::try_from(ttl_minutes)
        .ok()
        .and_then(|minutes| minutes.checked_mul(60))
        .map_or(i64::MAX, |seconds| issued_at.saturating_add(seconds))
}
