//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

//! Server-side SASL authentication. PLAIN is the supported mechanism.

use std::collections::HashMap;
use std::sync::Arc;

/// The PLAIN mechanism name.
pub const MECH_PLAIN: &str = "PLAIN";

// ---------------------------------------------------------------------------
// User registry
// ---------------------------------------------------------------------------

/// Username → password registry the PLAIN mechanism validates against.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<String, String>,
}

impl UserRegistry {
    pub fn new() -> UserRegistry {
        UserRegistry {
            users: HashMap::new(),
        }
    }

    pub fn add_user(&mut self, username: &str, password: &str) {
        self.users.insert(username.to_string(), password.to_string());
    }

    pub fn validate(&self, username: &str, password: &str) -> bool {
        self.users.get(username).map(String::as_str) == Some(password)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Authenticator errors. `AuthenticationFailed` is the protocol failure the
/// session surfaces with a fixed message; everything else is generic.
#[derive(Debug, PartialEq, Eq)]
pub enum SaslError {
    UnknownMechanism(String),
    AuthenticationFailed,
    AlreadyComplete,
}

impl std::fmt::Display for SaslError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaslError::UnknownMechanism(mech) => write!(f, "unknown SASL mechanism '{mech}'"),
            SaslError::AuthenticationFailed => f.write_str("authentication failed"),
            SaslError::AlreadyComplete => f.write_str("authentication already complete"),
        }
    }
}

impl std::error::Error for SaslError {}

// ---------------------------------------------------------------------------
// Server context
// ---------------------------------------------------------------------------

/// One in-progress authentication exchange. Created on the first SASL
/// request, discarded by the session once complete.
pub struct SaslServerContext {
    mechanism: String,
    registry: Arc<UserRegistry>,
    complete: bool,
    username: Option<String>,
}

impl SaslServerContext {
    pub fn new(registry: Arc<UserRegistry>, mechanism: &str) -> Result<SaslServerContext, SaslError> {
        if mechanism != MECH_PLAIN {
            return Err(SaslError::UnknownMechanism(mechanism.to_string()));
        }
        Ok(SaslServerContext {
            mechanism: mechanism.to_string(),
            registry,
            complete: false,
            username: None,
        })
    }

    /// Initial challenge bytes: the accepted mechanism name. Non-empty and
    /// deterministic; leaks nothing.
    pub fn initial_challenge(&self) -> Vec<u8> {
        self.mechanism.as_bytes().to_vec()
    }

    /// Advance the exchange with a client token; returns the next server
    /// token (empty on the final step).
    ///
    /// PLAIN tokens are `authzid NUL authcid NUL passwd`; the authzid is
    /// ignored.
    pub fn response(&mut self, token: &[u8]) -> Result<Vec<u8>, SaslError> {
        if self.complete {
            return Err(SaslError::AlreadyComplete);
        }
        let mut parts = token.split(|b| *b == 0);
        let (_authzid, authcid, passwd) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => return Err(SaslError::AuthenticationFailed),
        };
        if parts.next().is_some() {
            return Err(SaslError::AuthenticationFailed);
        }
        let username = std::str::from_utf8(authcid).map_err(|_| SaslError::AuthenticationFailed)?;
        let password = std::str::from_utf8(passwd).map_err(|_| SaslError::AuthenticationFailed)?;
        if username.is_empty() || !self.registry.validate(username, password) {
            return Err(SaslError::AuthenticationFailed);
        }
        self.complete = true;
        self.username = Some(username.to_string());
        Ok(Vec::new())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<UserRegistry> {
        let mut r = UserRegistry::new();
        r.add_user("alice", "secret");
        Arc::new(r)
    }

    #[test]
    fn plain_handshake_succeeds() {
        let mut ctx = SaslServerContext::new(registry(), MECH_PLAIN).unwrap();
        assert!(!ctx.initial_challenge().is_empty());
        assert!(!ctx.is_complete());
        let token = ctx.response(b"\0alice\0secret").unwrap();
        assert!(token.is_empty());
        assert!(ctx.is_complete());
        assert_eq!(ctx.username(), Some("alice"));
    }

    #[test]
    fn wrong_password_fails() {
        let mut ctx = SaslServerContext::new(registry(), MECH_PLAIN).unwrap();
        assert_eq!(
            ctx.response(b"\0alice\0wrong"),
            Err(SaslError::AuthenticationFailed)
        );
        assert!(!ctx.is_complete());
    }

    #[test]
    fn malformed_token_fails() {
        let mut ctx = SaslServerContext::new(registry(), MECH_PLAIN).unwrap();
        assert_eq!(ctx.response(b"alice"), Err(SaslError::AuthenticationFailed));
        assert_eq!(
            ctx.response(b"\0alice\0secret\0junk"),
            Err(SaslError::AuthenticationFailed)
        );
    }

    #[test]
    fn unknown_mechanism_is_rejected() {
        assert_eq!(
            SaslServerContext::new(registry(), "SCRAM-SHA-256").err(),
            Some(SaslError::UnknownMechanism("SCRAM-SHA-256".into()))
        );
    }
}
