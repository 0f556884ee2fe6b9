// RTSP Source 2 - Authentication
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;

use base64::Engine;
use rtsp_types::{headers::WWW_AUTHENTICATE, Response};
use tracing::debug;

use super::body::Body;
use super::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    Digest,
}

impl AuthMethod {
    fn from_scheme(scheme: &str) -> Option<Self> {
        if scheme.eq_ignore_ascii_case("basic") {
            Some(AuthMethod::Basic)
        } else if scheme.eq_ignore_ascii_case("digest") {
            Some(AuthMethod::Digest)
        } else {
            None
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Basic => "Basic",
            AuthMethod::Digest => "Digest",
        }
    }
}

/// One challenge from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: HashMap<String, String>,
}

/// Negotiated authentication for one control connection.
///
/// `already_attempted` bounds credential retries to one per logical request.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub method: Option<AuthMethod>,
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub(crate) opaque: Option<String>,
    pub(crate) qop: Option<Vec<String>>,
    pub(crate) algorithm: Option<String>,
    pub(crate) stale: bool,
    credentials: Option<(String, String)>,
    already_attempted: bool,
}

impl AuthState {
    pub fn new(credentials: Option<(String, String)>) -> Self {
        Self {
            credentials,
            ..Default::default()
        }
    }

    /// Marks the start of a new logical request.
    pub fn begin_request(&mut self) {
        self.already_attempted = false;
    }

    /// Handles a 401 and returns the `Authorization` value for the single retry.
    pub fn handle_unauthorized(&mut self, rsp: &Response<Body>) -> Result<String, ProtocolError> {
        if self.already_attempted {
            return Err(ProtocolError::AuthenticationFailed {
                method: self.method.map(AuthMethod::as_str).unwrap_or("none").to_string(),
                details: "Server rejected the provided credentials".to_string(),
            });
        }
        self.already_attempted = true;

        self.parse_challenge(rsp)?;
        let Some((user, pass)) = self.credentials.as_ref() else {
            return Err(ProtocolError::AuthenticationFailed {
                method: self.method.map(AuthMethod::as_str).unwrap_or("none").to_string(),
                details: "Authentication required but no credentials are configured"
                    .to_string(),
            });
        };

        match self.method {
            Some(AuthMethod::Basic) => Ok(basic_authorization(user, pass)),
            Some(AuthMethod::Digest) => {
                debug!(
                    "Digest challenge: algorithm {:?}, qop {:?}, opaque {:?}, stale {}",
                    self.algorithm, self.qop, self.opaque, self.stale
                );
                Err(ProtocolError::UnsupportedFeature {
                    feature: format!(
                        "Digest authentication ({})",
                        self.algorithm.as_deref().unwrap_or("MD5")
                    ),
                })
            }
            None => Err(ProtocolError::AuthenticationFailed {
                method: "none".to_string(),
                details: "No supported authentication challenge".to_string(),
            }),
        }
    }

    /// Parses all challenges of a 401 response, preferring Basic over Digest.
    pub fn parse_challenge(&mut self, rsp: &Response<Body>) -> Result<(), ProtocolError> {
        let Some(value) = rsp.header(&WWW_AUTHENTICATE) else {
            return Err(ProtocolError::MissingHeader {
                header: WWW_AUTHENTICATE.as_str().to_string(),
            });
        };
        debug!("Parsing WWW-Authenticate: {}", value.as_str());

        let challenges = parse_challenges(value.as_str());
        let chosen = challenges
            .iter()
            .find(|c| AuthMethod::from_scheme(&c.scheme) == Some(AuthMethod::Basic))
            .or_else(|| {
                challenges
                    .iter()
                    .find(|c| AuthMethod::from_scheme(&c.scheme).is_some())
            })
            .ok_or_else(|| ProtocolError::AuthenticationFailed {
                method: challenges
                    .first()
                    .map(|c| c.scheme.clone())
                    .unwrap_or_default(),
                details: format!("Unsupported authentication method: {}", value.as_str()),
            })?;

        self.method = AuthMethod::from_scheme(&chosen.scheme);
        self.realm = chosen.params.get("realm").cloned();
        self.nonce = chosen.params.get("nonce").cloned();
        self.opaque = chosen.params.get("opaque").cloned();
        self.algorithm = chosen.params.get("algorithm").cloned();
        self.qop = chosen
            .params
            .get("qop")
            .map(|q| q.split(',').map(|s| s.trim().to_string()).collect());
        self.stale = chosen
            .params
            .get("stale")
            .is_some_and(|s| s.eq_ignore_ascii_case("true"));

        if self.method == Some(AuthMethod::Digest) && self.nonce.is_none() {
            return Err(ProtocolError::AuthenticationFailed {
                method: "Digest".to_string(),
                details: "Digest challenge missing nonce".to_string(),
            });
        }

        Ok(())
    }
}

pub fn basic_authorization(username: &str, password: &str) -> String {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {encoded}")
}

/// Splits a header value that may carry several comma-joined challenges.
pub fn parse_challenges(value: &str) -> Vec<Challenge> {
    let mut challenges: Vec<Challenge> = Vec::new();

    for piece in split_unquoted_commas(value) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }

        // A new challenge starts with a bare scheme token
        let (head, rest) = match piece.find(char::is_whitespace) {
            Some(pos) => (&piece[..pos], piece[pos..].trim_start()),
            None => (piece, ""),
        };
        if !head.contains('=') && !rest.starts_with('=') {
            challenges.push(Challenge {
                scheme: head.to_string(),
                params: HashMap::new(),
            });
            if let Some((k, v)) = parse_single_param(rest) {
                if let Some(current) = challenges.last_mut() {
                    current.params.insert(k, v);
                }
            }
        } else if let Some(current) = challenges.last_mut() {
            if let Some((k, v)) = parse_single_param(piece) {
                current.params.insert(k, v);
            }
        }
    }

    challenges
}

fn split_unquoted_commas(s: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escape_next = false;

    for ch in s.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escape_next = true,
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => pieces.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}

fn parse_single_param(param: &str) -> Option<(String, String)> {
    let (key, value) = param.trim().split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key.trim().to_lowercase(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsp_types::{StatusCode, Version};

    fn unauthorized(www_auth: &str) -> Response<Body> {
        Response::builder(Version::V1_0, StatusCode::Unauthorized)
            .header(rtsp_types::headers::CSEQ, "2")
            .header(WWW_AUTHENTICATE, www_auth)
            .build(Body::default())
    }

    #[test]
    fn test_basic_auth_encoding() {
        assert_eq!(basic_authorization("user", "pass"), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_parse_challenges() {
        let challenges =
            parse_challenges(r#"Digest realm="Test, Realm", nonce="123", qop="auth", Basic realm="x""#);
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme, "Digest");
        assert_eq!(challenges[0].params["realm"], "Test, Realm");
        assert_eq!(challenges[0].params["nonce"], "123");
        assert_eq!(challenges[1].scheme, "Basic");
        assert_eq!(challenges[1].params["realm"], "x");
    }

    #[test]
    fn test_single_retry() {
        let mut auth = AuthState::new(Some(("user".to_string(), "pass".to_string())));
        let rsp = unauthorized(r#"Basic realm="cam""#);

        auth.begin_request();
        assert_eq!(auth.handle_unauthorized(&rsp).unwrap(), "Basic dXNlcjpwYXNz");
        assert_eq!(auth.realm.as_deref(), Some("cam"));
        assert!(matches!(
            auth.handle_unauthorized(&rsp),
            Err(ProtocolError::AuthenticationFailed { .. })
        ));

        auth.begin_request();
        assert!(auth.handle_unauthorized(&rsp).is_ok());
    }

    #[test]
    fn test_digest_unsupported() {
        let mut auth = AuthState::new(Some(("user".to_string(), "pass".to_string())));
        let rsp = unauthorized(
            r#"Digest realm="cam", nonce="abc123", algorithm=SHA-256, qop="auth,auth-int", opaque="xyz", stale=TRUE"#,
        );
        match auth.handle_unauthorized(&rsp) {
            Err(ProtocolError::UnsupportedFeature { feature }) => {
                assert_eq!(feature, "Digest authentication (SHA-256)")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(auth.method, Some(AuthMethod::Digest));
        assert_eq!(auth.nonce.as_deref(), Some("abc123"));
        assert_eq!(
            auth.qop,
            Some(vec!["auth".to_string(), "auth-int".to_string()])
        );
        assert_eq!(auth.opaque.as_deref(), Some("xyz"));
        assert!(auth.stale);
    }

    #[test]
    fn test_no_credentials() {
        let mut auth = AuthState::new(None);
        let rsp = unauthorized(r#"Basic realm="cam""#);
        assert!(matches!(
            auth.handle_unauthorized(&rsp),
            Err(ProtocolError::AuthenticationFailed { .. })
        ));
    }
}
