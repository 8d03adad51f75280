//! Token Verifier (C1).
//!
//! Validates a bearer credential and returns the set of endpoints it
//! permits plus its expiry. See `spec.md` §4.1.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use ttl_cache::TtlCache;

use crate::error::PikoError;

/// Claims carried by a signed token. Only fields Piko cares about are
/// modelled; unknown claims are ignored.
#[derive(Debug, Clone, Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    aud: Option<AudClaim>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    endpoints: Option<Vec<String>>,
    #[serde(default)]
    tenant: Option<String>,
}

/// `aud` may be a single string or an array per the JWT spec.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum AudClaim {
    Single(String),
    Many(Vec<String>),
}

impl AudClaim {
    fn contains(&self, expected: &str) -> bool {
        match self {
            AudClaim::Single(s) => s == expected,
            AudClaim::Many(v) => v.iter().any(|s| s == expected),
        }
    }
}

/// Result of a successful `Verify` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Token {
    /// `None` means non-expiring.
    pub expiry: Option<SystemTime>,
    /// Empty means all endpoints permitted.
    pub endpoints: Vec<String>,
    pub tenant: Option<String>,
}

impl Token {
    pub fn permits(&self, endpoint_id: &str) -> bool {
        self.endpoints.is_empty() || self.endpoints.iter().any(|e| e == endpoint_id)
    }

    /// Duration remaining until expiry, if any.
    pub fn expires_in(&self) -> Option<Duration> {
        self.expiry
            .map(|at| at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
    }
}

/// One configured signing family.
enum Verifier {
    Hmac {
        key: DecodingKey,
        audience: Option<String>,
        issuer: Option<String>,
    },
    Rsa {
        key: DecodingKey,
        audience: Option<String>,
        issuer: Option<String>,
    },
    Ecdsa {
        key: DecodingKey,
        audience: Option<String>,
        issuer: Option<String>,
    },
    JwkSet(JwksVerifier),
}

impl Verifier {
    fn decode(&self, token: &str) -> Result<Claims, PikoError> {
        match self {
            Verifier::Hmac { key, audience, issuer } => {
                decode_with(token, key, Algorithm::HS256, audience.as_deref(), issuer.as_deref())
            }
            Verifier::Rsa { key, audience, issuer } => {
                decode_with(token, key, Algorithm::RS256, audience.as_deref(), issuer.as_deref())
            }
            Verifier::Ecdsa { key, audience, issuer } => {
                decode_with(token, key, Algorithm::ES256, audience.as_deref(), issuer.as_deref())
            }
            Verifier::JwkSet(jwks) => jwks.decode(token),
        }
    }
}

fn decode_with(
    token: &str,
    key: &DecodingKey,
    alg: Algorithm,
    audience: Option<&str>,
    issuer: Option<&str>,
) -> Result<Claims, PikoError> {
    let mut validation = Validation::new(alg);
    validation.validate_exp = true;
    if let Some(aud) = audience {
        validation.set_audience(&[aud]);
    } else {
        validation.validate_aud = false;
    }
    if let Some(iss) = issuer {
        validation.set_issuer(&[iss]);
    }
    match decode::<Claims>(token, key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(err) => Err(classify_jwt_error(err)),
    }
}

fn classify_jwt_error(err: jsonwebtoken::errors::Error) -> PikoError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => PikoError::ExpiredToken,
        _ => PikoError::InvalidToken,
    }
}

/// Fetches and caches a JSON Web Key Set, re-fetching on cache miss.
struct JwksVerifier {
    endpoint: String,
    timeout: Duration,
    audience: Option<String>,
    issuer: Option<String>,
    cache: Mutex<TtlCache<String, DecodingKey>>,
    cache_ttl: Duration,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct Jwk {
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
    #[serde(rename = "kty")]
    kty: String,
}

#[derive(Deserialize)]
struct JwkSetDoc {
    keys: Vec<Jwk>,
}

impl JwksVerifier {
    fn decode(&self, token: &str) -> Result<Claims, PikoError> {
        let header = jsonwebtoken::decode_header(token).map_err(|_| PikoError::InvalidToken)?;
        let kid = header.kid.clone().unwrap_or_default();

        if let Some(key) = self.cache.lock().unwrap().get(&kid).cloned() {
            return decode_with(token, &key, header.alg, self.audience.as_deref(), self.issuer.as_deref());
        }

        let key = self.fetch_key(&kid)?;
        self.cache
            .lock()
            .unwrap()
            .insert(kid, key.clone(), self.cache_ttl);
        decode_with(token, &key, header.alg, self.audience.as_deref(), self.issuer.as_deref())
    }

    fn fetch_key(&self, kid: &str) -> Result<DecodingKey, PikoError> {
        let runtime = tokio::runtime::Handle::try_current();
        let doc: JwkSetDoc = match runtime {
            Ok(handle) => tokio::task::block_in_place(|| {
                handle.block_on(async {
                    self.http
                        .get(&self.endpoint)
                        .timeout(self.timeout)
                        .send()
                        .await
                        .map_err(|_| PikoError::InvalidToken)?
                        .json::<JwkSetDoc>()
                        .await
                        .map_err(|_| PikoError::InvalidToken)
                })
            })?,
            Err(_) => return Err(PikoError::InvalidToken),
        };
        let jwk = doc
            .keys
            .into_iter()
            .find(|k| k.kid.as_deref() == Some(kid) || kid.is_empty())
            .ok_or(PikoError::InvalidToken)?;
        if jwk.kty != "RSA" {
            return Err(PikoError::InvalidToken);
        }
        let (n, e) = (
            jwk.n.ok_or(PikoError::InvalidToken)?,
            jwk.e.ok_or(PikoError::InvalidToken)?,
        );
        DecodingKey::from_rsa_components(&n, &e).map_err(|_| PikoError::InvalidToken)
    }
}

/// Sum-type verifier over signing families, optionally multi-tenant. See
/// `spec.md` §4.1: when `tenant_id` is non-empty we index into the tenant
/// map; when tenants are configured and `tenant_id` is empty, verification
/// fails with `unknown-tenant` rather than falling back to a default.
pub struct TokenVerifier {
    default: Option<Verifier>,
    tenants: HashMap<String, Verifier>,
}

impl TokenVerifier {
    pub fn builder() -> TokenVerifierBuilder {
        TokenVerifierBuilder::default()
    }

    pub fn verify(&self, token: &str, tenant_id: &str) -> Result<Token, PikoError> {
        let bearer = token.strip_prefix("Bearer ").unwrap_or(token);

        let verifier = if !self.tenants.is_empty() {
            if tenant_id.is_empty() {
                return Err(PikoError::UnknownTenant);
            }
            self.tenants.get(tenant_id).ok_or(PikoError::UnknownTenant)?
        } else {
            self.default.as_ref().ok_or(PikoError::InvalidToken)?
        };

        let claims = verifier.decode(bearer)?;
        if let Some(exp) = claims.exp {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            if exp <= now {
                return Err(PikoError::ExpiredToken);
            }
        }

        Ok(Token {
            expiry: claims
                .exp
                .map(|exp| UNIX_EPOCH + Duration::from_secs(exp.max(0) as u64)),
            endpoints: claims.endpoints.unwrap_or_default(),
            tenant: claims.tenant,
        })
    }
}

#[derive(Default)]
pub struct TokenVerifierBuilder {
    default: Option<Verifier>,
    tenants: HashMap<String, Verifier>,
    default_audience: Option<String>,
    default_issuer: Option<String>,
}

impl TokenVerifierBuilder {
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.default_audience = Some(audience.into());
        self
    }

    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.default_issuer = Some(issuer.into());
        self
    }

    pub fn hmac_secret(mut self, secret: &[u8]) -> Self {
        self.default = Some(Verifier::Hmac {
            key: DecodingKey::from_secret(secret),
            audience: self.default_audience.clone(),
            issuer: self.default_issuer.clone(),
        });
        self
    }

    pub fn rsa_public_key_pem(mut self, pem: &[u8]) -> anyhow::Result<Self> {
        self.default = Some(Verifier::Rsa {
            key: DecodingKey::from_rsa_pem(pem)?,
            audience: self.default_audience.clone(),
            issuer: self.default_issuer.clone(),
        });
        Ok(self)
    }

    pub fn ecdsa_public_key_pem(mut self, pem: &[u8]) -> anyhow::Result<Self> {
        self.default = Some(Verifier::Ecdsa {
            key: DecodingKey::from_ec_pem(pem)?,
            audience: self.default_audience.clone(),
            issuer: self.default_issuer.clone(),
        });
        Ok(self)
    }

    pub fn jwks(mut self, endpoint: impl Into<String>, cache_ttl: Duration, timeout: Duration) -> Self {
        self.default = Some(Verifier::JwkSet(JwksVerifier {
            endpoint: endpoint.into(),
            timeout,
            audience: self.default_audience.clone(),
            issuer: self.default_issuer.clone(),
            cache: Mutex::new(TtlCache::new(64)),
            cache_ttl,
            http: reqwest::Client::new(),
        }));
        self
    }

    pub fn build(self) -> TokenVerifier {
        TokenVerifier {
            default: self.default,
            tenants: self.tenants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        exp: i64,
        endpoints: Vec<String>,
    }

    fn make_token(secret: &[u8], exp_delta_secs: i64, endpoints: Vec<String>) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = TestClaims {
            exp: now + exp_delta_secs,
            endpoints,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn verifies_valid_hmac_token_and_extracts_endpoints() {
        let secret = b"super-secret";
        let verifier = TokenVerifier::builder().hmac_secret(secret).build();
        let token = make_token(secret, 3600, vec!["e1".to_string()]);
        let result = verifier.verify(&token, "").unwrap();
        assert_eq!(result.endpoints, vec!["e1".to_string()]);
        assert!(result.permits("e1"));
        assert!(!result.permits("e2"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = b"super-secret";
        let verifier = TokenVerifier::builder().hmac_secret(secret).build();
        let token = make_token(secret, -10, vec![]);
        let err = verifier.verify(&token, "").unwrap_err();
        assert!(matches!(err, PikoError::ExpiredToken));
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let verifier = TokenVerifier::builder().hmac_secret(b"right").build();
        let token = make_token(b"wrong", 3600, vec![]);
        let err = verifier.verify(&token, "").unwrap_err();
        assert!(matches!(err, PikoError::InvalidToken));
    }

    #[test]
    fn empty_endpoints_permits_all() {
        let token = Token {
            expiry: None,
            endpoints: vec![],
            tenant: None,
        };
        assert!(token.permits("anything"));
    }

    #[test]
    fn tenant_required_once_any_tenant_configured() {
        let secret = b"tenant-secret";
        let mut builder = TokenVerifier::builder();
        builder.tenants.insert(
            "acme".to_string(),
            Verifier::Hmac {
                key: DecodingKey::from_secret(secret),
                audience: None,
                issuer: None,
            },
        );
        let verifier = builder.build();
        let token = make_token(secret, 3600, vec![]);
        let err = verifier.verify(&token, "").unwrap_err();
        assert!(matches!(err, PikoError::UnknownTenant));

        let ok = verifier.verify(&token, "acme").unwrap();
        assert!(ok.endpoints.is_empty());

        let err2 = verifier.verify(&token, "other").unwrap_err();
        assert!(matches!(err2, PikoError::UnknownTenant));
    }
}
