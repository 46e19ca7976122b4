//! Bearer-token verification against the external identity provider.
//!
//! The provider issues signed JWTs; this module checks the signature and
//! standard claims and resolves the caller into a [`VerifiedIdentity`] whose
//! [`Role`] is decided once, here, instead of at each call site.

use crate::error::AppError;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

/// Capability of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    fn from_claim(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "admin" => Role::Admin,
            _ => Role::User,
        }
    }
}

/// Signing algorithm used by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtAlgorithm {
    /// Asymmetric; the key is the provider's PEM-encoded public key.
    Rs256,
    /// Symmetric; the key is the shared secret.
    Hs256,
}

impl std::str::FromStr for JwtAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RS256" => Ok(JwtAlgorithm::Rs256),
            "HS256" => Ok(JwtAlgorithm::Hs256),
            _ => Err(format!("Unsupported JWT algorithm: {}", s)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdentityClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    metadata: Option<ClaimsMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct ClaimsMetadata {
    #[serde(default)]
    role: Option<String>,
}

/// The caller behind a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Stable subject identifier issued by the provider.
    pub user_id: String,
    pub email: Option<String>,
    pub role: Role,
}

impl VerifiedIdentity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Clone)]
pub struct IdentityVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl IdentityVerifier {
    pub fn new(
        algorithm: JwtAlgorithm,
        key: &str,
        issuer: Option<&str>,
        audience: Option<&str>,
    ) -> Result<Self, AppError> {
        let (decoding_key, mut validation) = match algorithm {
            JwtAlgorithm::Rs256 => (
                DecodingKey::from_rsa_pem(key.as_bytes()).map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "Failed to parse identity provider public key: {}",
                        e
                    ))
                })?,
                Validation::new(Algorithm::RS256),
            ),
            JwtAlgorithm::Hs256 => {
                if key.is_empty() {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "Identity provider shared secret is empty"
                    )));
                }
                (
                    DecodingKey::from_secret(key.as_bytes()),
                    Validation::new(Algorithm::HS256),
                )
            }
        };

        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        tracing::info!(algorithm = ?algorithm, "Identity verifier initialized");

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    /// Verify a raw bearer token and resolve the caller.
    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity, AppError> {
        let data = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)?;
        let claims = data.claims;

        if claims.sub.trim().is_empty() {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Token has no subject"
            )));
        }

        let role_claim = claims
            .role
            .as_deref()
            .or_else(|| claims.metadata.as_ref().and_then(|m| m.role.as_deref()));

        Ok(VerifiedIdentity {
            user_id: claims.sub,
            email: claims.email,
            role: Role::from_claim(role_claim),
        })
    }
}
