use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// The identity a verified token carries. The user id is an opaque string;
/// it is the only claim the collaboration core trusts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub user_id: String,
}

#[derive(Clone)]
pub struct AccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_token(&self, user_id: &str) -> anyhow::Result<String> {
        self.issue_token_at(user_id, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, user_id: &str, issued_at: i64) -> anyhow::Result<String> {
        if user_id.trim().is_empty() {
            bail!("cannot issue a token for an empty user id");
        }

        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    pub fn verify_token(&self, token: &str) -> anyhow::Result<TokenIdentity> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        if claims.sub.trim().is_empty() {
            bail!("access token subject is empty");
        }

        Ok(TokenIdentity { user_id: claims.sub })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, AccessTokenService, ACCESS_TOKEN_TTL_SECONDS};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;

    const TEST_SECRET: &str = "coedit_test_secret_that_is_definitely_long_enough";

    #[test]
    fn issues_and_verifies_tokens() {
        let service = AccessTokenService::new(TEST_SECRET).expect("service should initialize");

        let token = service.issue_token("alice").expect("token should be issued");
        let identity = service.verify_token(&token).expect("token should verify");

        assert_eq!(identity.user_id, "alice");
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(AccessTokenService::new("too-short").is_err());
    }

    #[test]
    fn rejects_tampered_tokens() {
        let service = AccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let token = service.issue_token("alice").expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(service.verify_token(&tampered).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let service = AccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token =
            service.issue_token_at("alice", issued_at).expect("token should be issued");

        assert!(service.verify_token(&token).is_err());
    }

    #[test]
    fn rejects_empty_user_ids_at_issue_and_verify() {
        let service = AccessTokenService::new(TEST_SECRET).expect("service should initialize");
        assert!(service.issue_token("   ").is_err());

        #[derive(Serialize)]
        struct EmptySubjectClaims {
            sub: &'static str,
            iat: i64,
            exp: i64,
        }

        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let claims = EmptySubjectClaims { sub: "", iat: now, exp: now + ACCESS_TOKEN_TTL_SECONDS };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(service.verify_token(&token).is_err());
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let service = AccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let other = AccessTokenService::new("another_secret_that_is_also_long_enough!!")
            .expect("service should initialize");

        let token = other.issue_token("alice").expect("token should be issued");
        assert!(service.verify_token(&token).is_err());
    }
}
