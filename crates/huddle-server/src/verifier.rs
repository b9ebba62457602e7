//! Identity verifier selection

use anyhow::{bail, Result};
use huddle_config::{AuthConfig, AuthMode};
use huddle_gateway::{Identity, IdentityVerifier, JwtVerifier, StaticTokenVerifier};
use std::sync::Arc;

/// Build the verifier for the configured auth mode
pub fn build_verifier(auth: &AuthConfig) -> Result<Arc<dyn IdentityVerifier>> {
    match auth.mode {
        AuthMode::Jwt => {
            let Some(secret) = auth.jwt_secret.as_deref().filter(|s| !s.is_empty()) else {
                bail!("auth.jwt_secret is required in jwt mode");
            };
            Ok(Arc::new(JwtVerifier::new(secret.as_bytes())))
        }
        AuthMode::Static => {
            if auth.static_tokens.is_empty() {
                bail!("auth.static_tokens must not be empty in static mode");
            }
            let verifier: StaticTokenVerifier = auth
                .static_tokens
                .iter()
                .map(|t| {
                    (
                        t.token.clone(),
                        Identity::new(t.user_id.clone(), t.display_name.clone()),
                    )
                })
                .collect();
            Ok(Arc::new(verifier))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_config::StaticToken;

    #[test]
    fn test_static_mode() {
        let auth = AuthConfig {
            mode: AuthMode::Static,
            jwt_secret: None,
            static_tokens: vec![StaticToken {
                token: "dev".to_string(),
                user_id: "u-1".to_string(),
                display_name: "Dev".to_string(),
            }],
        };
        let verifier = build_verifier(&auth).unwrap();
        assert_eq!(verifier.verify("dev").unwrap(), Identity::new("u-1", "Dev"));
        assert!(verifier.verify("prod").is_err());
    }

    #[test]
    fn test_jwt_mode_needs_secret() {
        let auth = AuthConfig::default();
        assert!(build_verifier(&auth).is_err());

        let auth = AuthConfig {
            jwt_secret: Some("s3cret".to_string()),
            ..AuthConfig::default()
        };
        assert!(build_verifier(&auth).is_ok());
    }
}
