//! Parses and verifies inbound provider push payloads (§4.B of the spec).
//!
//! `verify` checks the `X-Hub-Signature-256` header against an HMAC-SHA256
//! of the raw request body; `interpret` derives the repository/branch pair
//! and the commit metadata a push carries, then matches it against the
//! configured services.

use axum::http::StatusCode;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::persistence::models::ServiceDef;

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook signature. If `secret` is empty, signatures are not
/// required and this always returns `true`.
pub fn verify(body: &[u8], signature_header: Option<&str>, secret: &str) -> bool {
    if secret.is_empty() {
        return true;
    }

    let Some(header) = signature_header else {
        return false;
    };

    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    // Constant-time comparison; also guards against a length mismatch
    // leaking timing information.
    computed.len() == expected.len() && computed.ct_eq(&expected).into()
}

#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("Content-Type must be application/json")]
    BadContentType,
    #[error("request body is empty")]
    EmptyBody,
    #[error("invalid webhook signature")]
    BadSignature,
    #[error("invalid JSON: {0}")]
    BadJson(String),
    #[error("payload is missing or has a malformed '{0}' field")]
    BadShape(&'static str),
    #[error("no service configured for {0}@{1}")]
    UnknownTarget(String, String),
}

impl InterpretError {
    pub fn status(&self) -> StatusCode {
        match self {
            InterpretError::BadSignature => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// The result of successfully matching a push payload to a configured
/// service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub service: ServiceDef,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
}

fn str_field<'a>(value: &'a Value, field: &'static str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

/// Parse a push payload and match it against the configured services.
///
/// Caller is responsible for enforcing `Content-Type: application/json` and
/// rejecting an empty body before calling this (those are checked at the
/// HTTP boundary so the error can be mapped before JSON parsing is even
/// attempted).
pub fn interpret(payload: &[u8], services: &[ServiceDef]) -> Result<MatchResult, InterpretError> {
    if payload.is_empty() {
        return Err(InterpretError::EmptyBody);
    }

    let json: Value =
        serde_json::from_slice(payload).map_err(|e| InterpretError::BadJson(e.to_string()))?;

    let repository = json
        .get("repository")
        .filter(|v| v.is_object())
        .ok_or(InterpretError::BadShape("repository"))?;

    let full_name = str_field(repository, "full_name")
        .map(str::to_owned)
        .or_else(|| {
            let owner = repository.get("owner")?;
            let owner_name = str_field(owner, "login").or_else(|| str_field(owner, "name"))?;
            let name = str_field(repository, "name")?;
            Some(format!("{owner_name}/{name}"))
        })
        .ok_or(InterpretError::BadShape("repository"))?;

    let git_ref = str_field(&json, "ref").ok_or(InterpretError::BadShape("ref"))?;
    let branch = git_ref
        .strip_prefix("refs/heads/")
        .ok_or(InterpretError::BadShape("ref"))?
        .to_owned();

    let service = services
        .iter()
        .find(|s| s.repository == full_name && s.branch == branch)
        .cloned()
        .ok_or_else(|| InterpretError::UnknownTarget(full_name.clone(), branch.clone()))?;

    let (commit_sha, commit_message) = json
        .get("commits")
        .and_then(Value::as_array)
        .and_then(|commits| commits.last())
        .map(|commit| {
            (
                str_field(commit, "id").map(str::to_owned),
                str_field(commit, "message").map(str::to_owned),
            )
        })
        .unwrap_or((None, None));

    Ok(MatchResult {
        service,
        branch,
        commit_sha,
        commit_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, repository: &str, branch: &str) -> ServiceDef {
        ServiceDef {
            name: name.into(),
            repository: repository.into(),
            path: "/tmp/x".into(),
            branch: branch.into(),
            deploy_command: "echo hi".into(),
        }
    }

    #[test]
    fn verify_accepts_unsigned_when_secret_is_empty() {
        assert!(verify(b"anything", None, ""));
    }

    #[test]
    fn verify_matches_correct_signature() {
        let secret = "topsecret";
        let body = b"{\"a\":1}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");

        assert!(verify(body, Some(&header), secret));
    }

    #[test]
    fn verify_rejects_any_single_byte_mutation() {
        let secret = "topsecret";
        let body = b"{\"a\":1}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");

        assert!(!verify(b"{\"a\":2}", Some(&header), secret));
        assert!(!verify(body, Some(&header), "wrong-secret"));

        let mut mutated = digest.clone();
        mutated.replace_range(0..1, if &digest[0..1] == "a" { "b" } else { "a" });
        assert!(!verify(body, Some(&format!("sha256={mutated}")), secret));
    }

    #[test]
    fn verify_rejects_missing_or_malformed_header_when_secret_set() {
        assert!(!verify(b"body", None, "secret"));
        assert!(!verify(b"body", Some("not-sha256"), "secret"));
        assert!(!verify(b"body", Some("sha256=zz"), "secret"));
    }

    #[test]
    fn interpret_matches_full_name() {
        let services = vec![service("web", "alice/site", "main")];
        let payload = br#"{"repository":{"full_name":"alice/site"},"ref":"refs/heads/main","commits":[{"id":"abc","message":"m"}]}"#;

        let result = interpret(payload, &services).unwrap();
        assert_eq!(result.service.name, "web");
        assert_eq!(result.branch, "main");
        assert_eq!(result.commit_sha.as_deref(), Some("abc"));
        assert_eq!(result.commit_message.as_deref(), Some("m"));
    }

    #[test]
    fn interpret_derives_full_name_from_owner_and_name() {
        let services = vec![service("web", "alice/site", "main")];
        let payload =
            br#"{"repository":{"owner":{"login":"alice"},"name":"site"},"ref":"refs/heads/main"}"#;

        let result = interpret(payload, &services).unwrap();
        assert_eq!(result.service.name, "web");
        assert_eq!(result.commit_sha, None);
    }

    #[test]
    fn interpret_rejects_unknown_branch() {
        let services = vec![service("web", "alice/site", "main")];
        let payload = br#"{"repository":{"full_name":"alice/site"},"ref":"refs/heads/dev"}"#;

        match interpret(payload, &services) {
            Err(InterpretError::UnknownTarget(repo, branch)) => {
                assert_eq!(repo, "alice/site");
                assert_eq!(branch, "dev");
            }
            other => panic!("expected UnknownTarget, got {other:?}"),
        }
    }

    #[test]
    fn interpret_rejects_missing_ref() {
        let services = vec![service("web", "alice/site", "main")];
        let payload = br#"{"repository":{"full_name":"alice/site"}}"#;

        assert!(matches!(
            interpret(payload, &services),
            Err(InterpretError::BadShape("ref"))
        ));
    }

    #[test]
    fn interpret_rejects_empty_body() {
        let services = vec![];
        assert!(matches!(
            interpret(b"", &services),
            Err(InterpretError::EmptyBody)
        ));
    }
}
