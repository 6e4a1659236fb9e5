#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use relay_domain::UserId;
use relay_protocol::pb;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::config::SecretString;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Credentials a `Hello` is checked against. No credentials means the relay is open.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	pub auth_token: Option<SecretString>,
	pub hmac_secret: Option<SecretString>,
}

impl AuthSettings {
	pub fn required(&self) -> bool {
		self.auth_token.is_some() || self.hmac_secret.is_some()
	}
}

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing auth token")]
	MissingToken,
	#[error("invalid auth token: {0}")]
	InvalidToken(String),
}

/// Identity bound to a session after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
	pub identity: UserId,
	/// `false` for placeholder identities assigned to anonymous connections.
	pub authenticated: bool,
}

/// Check a `Hello` against `settings` and pick the session identity.
///
/// A signed token's subject wins over the claimed identity; a connection that presents
/// neither gets a per-connection placeholder.
pub fn authenticate_hello(conn_id: u64, hello: &pb::Hello, settings: &AuthSettings) -> Result<SessionIdentity, AuthError> {
	let token = hello.auth_token.trim();
	let mut subject = None;

	if settings.required() {
		if token.is_empty() {
			return Err(AuthError::MissingToken);
		}

		let static_ok = settings
			.auth_token
			.as_ref()
			.is_some_and(|expected| constant_time_eq(expected.expose().as_bytes(), token.as_bytes()));

		if !static_ok {
			let Some(secret) = settings.hmac_secret.as_ref() else {
				return Err(AuthError::InvalidToken("token mismatch".to_string()));
			};
			let claims =
				verify_hmac_token(token, secret.expose()).map_err(|e| AuthError::InvalidToken(format!("{e:#}")))?;
			debug!(conn_id, sub = %claims.sub, "hmac token verified");
			subject = Some(claims.sub);
		}
	}

	let claimed = subject.or_else(|| Some(hello.identity.clone()));
	match claimed.and_then(|s| UserId::new(s).ok()) {
		Some(identity) => Ok(SessionIdentity {
			identity,
			authenticated: true,
		}),
		None => Ok(SessionIdentity {
			identity: UserId::anonymous(conn_id),
			authenticated: false,
		}),
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).context("hmac key")?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
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

/// Mint a `v1.<payload>.<sig>` token; shared with the QUIC tests.
#[cfg(test)]
pub(crate) fn mint_token(sub: &str, exp: u64, secret: &str) -> String {
	let payload = serde_json::json!({ "sub": sub, "exp": exp }).to_string();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload.as_bytes());
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes()).expect("sign");
	format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn far_future() -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).expect("clock").as_secs() + 3600
	}

	fn hello(identity: &str, token: &str) -> pb::Hello {
		pb::Hello {
			client_name: "test".to_string(),
			identity: identity.to_string(),
			auth_token: token.to_string(),
		}
	}

	fn hmac_only(secret: &str) -> AuthSettings {
		AuthSettings {
			auth_token: None,
			hmac_secret: Some(SecretString::new(secret)),
		}
	}

	#[test]
	fn open_relay_uses_claimed_identity_or_placeholder() {
		let open = AuthSettings::default();
		let s = authenticate_hello(1, &hello(" alice ", ""), &open).expect("open");
		assert_eq!(s.identity.as_str(), "alice");
		assert!(s.authenticated);

		let s = authenticate_hello(42, &hello("  ", ""), &open).expect("open");
		assert_eq!(s.identity, UserId::anonymous(42));
		assert!(!s.authenticated);
	}

	#[test]
	fn static_token_must_match() {
		let settings = AuthSettings {
			auth_token: Some(SecretString::new("letmein")),
			hmac_secret: None,
		};
		assert!(authenticate_hello(1, &hello("alice", "letmein"), &settings).is_ok());
		assert!(matches!(
			authenticate_hello(1, &hello("alice", "nope"), &settings),
			Err(AuthError::InvalidToken(_))
		));
		assert!(matches!(
			authenticate_hello(1, &hello("alice", ""), &settings),
			Err(AuthError::MissingToken)
		));
	}

	#[test]
	fn hmac_subject_overrides_claimed_identity() {
		let token = mint_token("bob", far_future(), "k");
		let s = authenticate_hello(1, &hello("mallory", &token), &hmac_only("k")).expect("valid token");
		assert_eq!(s.identity.as_str(), "bob");
		assert!(s.authenticated);
	}

	#[test]
	fn hmac_rejects_wrong_secret_and_expired_tokens() {
		let token = mint_token("bob", far_future(), "other");
		assert!(authenticate_hello(1, &hello("", &token), &hmac_only("k")).is_err());

		let expired = mint_token("bob", 1, "k");
		let err = verify_hmac_token(&expired, "k").expect_err("expired");
		assert!(err.to_string().contains("expired"));

		assert!(verify_hmac_token("v2.a.b", "k").is_err());
	}
}
