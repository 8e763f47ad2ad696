use std::sync::Arc;

use opsdeck_orchestrator::{Orchestrator, DEV_FALLBACK_SECRET};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

mod http;

pub use http::*;

/// How API requests are authenticated.
#[derive(Clone)]
pub enum ApiAuth {
    /// Requests must carry this bearer token.
    Token(Arc<str>),
    /// Production without a configured token; every request is refused.
    Misconfigured,
}

impl ApiAuth {
    /// Blank tokens count as unset. Outside production the development token
    /// stands in for a missing one.
    pub fn resolve(token: Option<&str>, production: bool) -> Self {
        match token.map(str::trim).filter(|token| !token.is_empty()) {
            Some(token) => ApiAuth::Token(Arc::from(token)),
            None if production => ApiAuth::Misconfigured,
            None => ApiAuth::Token(Arc::from(DEV_FALLBACK_SECRET)),
        }
    }

    pub fn is_dev_fallback(&self) -> bool {
        matches!(self, ApiAuth::Token(token) if token.as_ref() == DEV_FALLBACK_SECRET)
    }
}

impl std::fmt::Debug for ApiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiAuth::Token(token) => f
                .debug_tuple("Token")
                .field(&opsdeck_observability::redact_text(token))
                .finish(),
            ApiAuth::Misconfigured => f.write_str("Misconfigured"),
        }
    }
}

/// Compare two tokens in constant time over their SHA-256 digests, so length
/// differences do not leak either.
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
    let expected: [u8; 32] = Sha256::digest(expected.as_bytes()).into();
    provided.ct_eq(&expected).into()
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub auth: ApiAuth,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, auth: ApiAuth) -> Self {
        Self { orchestrator, auth }
    }
}
