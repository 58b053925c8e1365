#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use confab_domain::UserId;
use confab_protocol::UserSnapshot;
use confab_sfu::SecretString;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Mutex;

/// Verified results may be cached in-process for up to one hour by token
/// string (bounded by the token's own expiry).
const TOKEN_CACHE_TTL_SECS: u64 = 3600;
const TOKEN_CACHE_MAX_ENTRIES: usize = 4096;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("invalid token: {0}")]
	Invalid(String),

	#[error("token expired")]
	Expired,
}

/// Claims carried inside a `v1.<payload>.<sig>` token minted by the REST
/// surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: i64,
	pub name: String,
	#[serde(default)]
	pub avatar: Option<String>,
	pub exp: u64,
}

impl AuthClaims {
	pub fn snapshot(&self) -> UserSnapshot {
		UserSnapshot {
			id: UserId(self.sub),
			name: self.name.clone(),
			avatar: self.avatar.clone(),
		}
	}
}

fn unix_secs_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Verify a `v1.<payload>.<sig>` HMAC-SHA256 token.
pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::Invalid("unexpected token format".to_string()));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|e| AuthError::Invalid(format!("payload decode: {e}")))?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|e| AuthError::Invalid(format!("signature decode: {e}")))?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::Invalid("signature mismatch".to_string()));
	}

	let claims: AuthClaims =
		serde_json::from_slice(&payload).map_err(|e| AuthError::Invalid(format!("claims parse: {e}")))?;
	if claims.exp <= unix_secs_now() {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Mint a token in the verifier's format. The token issuer lives in the
/// REST surface; this exists for tooling and tests of the contract.
pub fn mint_hmac_token(claims: &AuthClaims, secret: &str) -> String {
	let payload = serde_json::to_vec(claims).expect("claims are always serializable");
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

struct CacheEntry {
	snapshot: UserSnapshot,
	expires_at_unix: u64,
}

/// Token verifier with an in-process result cache.
pub struct AuthVerifier {
	secret: SecretString,
	cache: Mutex<HashMap<String, CacheEntry>>,
}

impl AuthVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self {
			secret,
			cache: Mutex::new(HashMap::new()),
		}
	}

	/// Resolve a bearer token to a user snapshot.
	pub async fn verify(&self, token: &str) -> Result<UserSnapshot, AuthError> {
		let now = unix_secs_now();

		{
			let cache = self.cache.lock().await;
			if let Some(entry) = cache.get(token)
				&& entry.expires_at_unix > now
			{
				metrics::counter!("confab_server_auth_cache_hits_total").increment(1);
				return Ok(entry.snapshot.clone());
			}
		}

		let claims = verify_hmac_token(token, self.secret.expose())?;
		let snapshot = claims.snapshot();

		let mut cache = self.cache.lock().await;
		if cache.len() >= TOKEN_CACHE_MAX_ENTRIES {
			cache.clear();
		}
		cache.insert(
			token.to_string(),
			CacheEntry {
				snapshot: snapshot.clone(),
				expires_at_unix: claims.exp.min(now + TOKEN_CACHE_TTL_SECS),
			},
		);

		Ok(snapshot)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn claims(sub: i64, exp: u64) -> AuthClaims {
		AuthClaims {
			sub,
			name: format!("user-{sub}"),
			avatar: None,
			exp,
		}
	}

	#[test]
	fn verifies_minted_token() {
		let token = mint_hmac_token(&claims(7, unix_secs_now() + 60), "s3cret");
		let verified = verify_hmac_token(&token, "s3cret").expect("valid token");
		assert_eq!(verified.sub, 7);
		assert_eq!(verified.name, "user-7");
	}

	#[test]
	fn rejects_wrong_secret_and_garbage() {
		let token = mint_hmac_token(&claims(7, unix_secs_now() + 60), "s3cret");
		assert!(matches!(verify_hmac_token(&token, "other"), Err(AuthError::Invalid(_))));
		assert!(matches!(verify_hmac_token("v1.only-two", "s3cret"), Err(AuthError::Invalid(_))));
		assert!(matches!(verify_hmac_token("v2.a.b", "s3cret"), Err(AuthError::Invalid(_))));
	}

	#[test]
	fn rejects_expired_token() {
		let token = mint_hmac_token(&claims(7, unix_secs_now().saturating_sub(1)), "s3cret");
		assert!(matches!(verify_hmac_token(&token, "s3cret"), Err(AuthError::Expired)));
	}

	#[test]
	fn rejects_tampered_payload() {
		let token = mint_hmac_token(&claims(7, unix_secs_now() + 60), "s3cret");
		let parts: Vec<&str> = token.split('.').collect();
		let other_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims(8, unix_secs_now() + 60)).unwrap());
		let forged = format!("v1.{other_payload}.{}", parts[2]);
		assert!(matches!(verify_hmac_token(&forged, "s3cret"), Err(AuthError::Invalid(_))));
	}

	#[tokio::test]
	async fn verifier_caches_by_token_string() {
		let verifier = AuthVerifier::new(SecretString::new("s3cret"));
		let token = mint_hmac_token(&claims(7, unix_secs_now() + 60), "s3cret");

		let first = verifier.verify(&token).await.expect("valid");
		let second = verifier.verify(&token).await.expect("cached");
		assert_eq!(first, second);

		assert!(verifier.verify("v1.bogus.bogus").await.is_err());
	}
}
