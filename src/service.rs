//! The trusted-token service façade.
//!
//! Resolves an identity for each incoming request, freshly every time, in a
//! fixed order: trusted-header path, session path, cookie path. Decode
//! failures never surface as errors — a bad cookie is cleared on the
//! response and resolution degrades to "unauthenticated"; whatever sits in
//! front of this service (a login redirect, usually) decides what happens
//! next.
//!
//! The HTTP framework stays behind the [`TokenRequest`] and
//! [`TokenResponse`] traits; an actix adapter lives in [`crate::server`].

use crate::cache::SharedKeyCache;
use crate::codec::{self, DecodedToken};
use crate::config::TokenConfig;
use crate::ring::KeyRing;
use crate::util::{Clock, SystemClock};
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A cookie as presented on a request. `secure` is `None` when the
/// transport did not carry the attribute (browsers never echo it back).
#[derive(Debug, Clone)]
pub struct RequestCookie {
    pub value: String,
    pub secure: Option<bool>,
}

/// A cookie to attach to a response. `max_age_secs: None` means a session
/// cookie; `Some(0)` deletes the cookie on the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCookie {
    pub name: String,
    pub value: String,
    pub max_age_secs: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub path: String,
}

/// The slice of an incoming request this service needs.
///
/// Session accessors use interior mutability because the surrounding
/// framework owns the session; implementations without sessions return
/// `None` and ignore writes.
pub trait TokenRequest {
    fn header(&self, name: &str) -> Option<String>;
    fn parameter(&self, name: &str) -> Option<String>;
    fn remote_addr(&self) -> Option<String>;
    /// All request cookies carrying `name`, in order.
    fn cookies(&self, name: &str) -> Vec<RequestCookie>;
    fn session_subject(&self) -> Option<String>;
    fn set_session_subject(&self, subject: Option<String>);
    /// Identity already asserted by an upstream authentication mechanism.
    fn principal(&self) -> Option<String>;
}

/// The slice of an outgoing response this service needs.
pub trait TokenResponse {
    fn add_cookie(&mut self, cookie: ResponseCookie);
    fn add_header(&mut self, name: &str, value: &str);
}

/// Where a resolved identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    TrustedHeader,
    Session,
    Cookie,
}

/// A verified identity extracted from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedCredentials {
    pub subject: String,
    pub source: CredentialSource,
}

/// Issues, refreshes, and verifies trusted tokens for HTTP requests.
pub struct TrustedTokenService {
    config: TokenConfig,
    ring: KeyRing,
    clock: Arc<dyn Clock>,
}

impl TrustedTokenService {
    pub fn new(config: TokenConfig, cache: Arc<dyn SharedKeyCache>) -> Result<Self> {
        Self::with_clock(config, cache, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: TokenConfig,
        cache: Arc<dyn SharedKeyCache>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let server_id = config.effective_server_id();
        let ring = KeyRing::open(
            &server_id,
            config.ttl_ms,
            config.ring_size,
            &config.snapshot_path,
            cache,
            clock.clone(),
        );
        Ok(Self {
            config,
            ring,
            clock,
        })
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn ring(&self) -> &KeyRing {
        &self.ring
    }

    /// Resolve the identity carried by `req`, if any.
    ///
    /// A valid cookie in its second half-life is transparently replaced on
    /// `resp`; invalid cookies are cleared and skipped.
    pub fn authenticate(
        &self,
        req: &dyn TokenRequest,
        resp: &mut dyn TokenResponse,
    ) -> Option<TrustedCredentials> {
        if let Some(subject) = self.trusted_header_subject(req) {
            debug!("trusted header authenticated {subject}");
            return Some(TrustedCredentials {
                subject,
                source: CredentialSource::TrustedHeader,
            });
        }

        if self.config.use_session {
            return req.session_subject().map(|subject| TrustedCredentials {
                subject,
                source: CredentialSource::Session,
            });
        }

        for cookie in req.cookies(&self.config.cookie_name) {
            if self.config.secure_cookie && cookie.secure == Some(false) {
                continue;
            }
            match codec::decode(&cookie.value, &self.ring, self.clock.now_millis()) {
                Ok(decoded) => {
                    debug!("token is valid and decoded to {}", decoded.subject);
                    self.refresh_token(resp, &decoded);
                    return Some(TrustedCredentials {
                        subject: decoded.subject,
                        source: CredentialSource::Cookie,
                    });
                }
                Err(e) => {
                    debug!("invalid cookie: {e}");
                    self.clear_cookie(resp);
                }
            }
        }
        None
    }

    /// Mint a token for an identity asserted upstream and attach it to the
    /// response (or session). Returns the subject that was injected.
    ///
    /// The subject comes from, in order: a trusted proxy's header or request
    /// parameter (only for allow-listed proxy addresses), then the request's
    /// own asserted principal.
    pub fn inject_token(
        &self,
        req: &dyn TokenRequest,
        resp: &mut dyn TokenResponse,
    ) -> Option<String> {
        let mut subject: Option<String> = None;
        if let Some(addr) = req.remote_addr() {
            if self.config.trusted_proxy_addrs.contains(&addr) {
                if !self.config.proxy_header_name.is_empty() {
                    subject = req
                        .header(&self.config.proxy_header_name)
                        .filter(|s| !s.trim().is_empty());
                    if let Some(s) = &subject {
                        debug!(
                            "injecting trusted token: header [{}] asserted [{s}]",
                            self.config.proxy_header_name
                        );
                    }
                }
                if subject.is_none() && !self.config.proxy_parameter_name.is_empty() {
                    subject = req
                        .parameter(&self.config.proxy_parameter_name)
                        .filter(|s| !s.trim().is_empty());
                    if let Some(s) = &subject {
                        debug!(
                            "injecting trusted token: parameter [{}] asserted [{s}]",
                            self.config.proxy_parameter_name
                        );
                    }
                }
            }
        }
        let subject = match subject.or_else(|| req.principal()) {
            Some(s) => s,
            None => {
                warn!("unable to inject token; unable to determine user from request");
                return None;
            }
        };

        if self.config.use_session {
            debug!("injecting credentials into session for {subject}");
            req.set_session_subject(Some(subject.clone()));
        } else {
            self.set_auth_cookie(resp, &subject);
        }
        // Downstream listeners (user provisioning and the like) watch for
        // this event.
        info!(target: "trustring::events", user = %subject, "user trusted");
        Some(subject)
    }

    /// Remove credentials so subsequent requests arrive unauthenticated.
    pub fn drop_credentials(&self, req: &dyn TokenRequest, resp: &mut dyn TokenResponse) {
        if self.config.use_session {
            req.set_session_subject(None);
        } else {
            self.clear_cookie(resp);
        }
    }

    fn trusted_header_subject(&self, req: &dyn TokenRequest) -> Option<String> {
        if !self.config.server_token_enabled {
            return None;
        }
        let raw = req.header(&self.config.token_header_name)?;
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let host = req.remote_addr().unwrap_or_default();
        if !self.config.safe_host_addrs.iter().any(|a| a == &host) {
            warn!("ignoring trusted token request from {host}");
            return None;
        }

        let parts: Vec<&str> = raw.split(';').collect();
        let &[hash, subject, timestamp] = parts.as_slice() else {
            warn!(
                "illegal number of elements in trusted server token: {}",
                parts.len()
            );
            return None;
        };
        if codec::verify_server_token_hmac(subject, timestamp, &self.config.shared_secret, hash)
        {
            Some(subject.to_string())
        } else {
            debug!("server token HMAC match failed for {subject}");
            None
        }
    }

    /// Replace a cookie entering its second half-life, so active users
    /// never see their token expire.
    fn refresh_token(&self, resp: &mut dyn TokenResponse, decoded: &DecodedToken) {
        let now = self.clock.now_millis();
        if now + self.config.ttl_ms / 2 > decoded.expires_at {
            debug!(
                "refreshing token for {} (expires at {})",
                decoded.subject, decoded.expires_at
            );
            self.set_auth_cookie(resp, &decoded.subject);
        }
    }

    fn encode_cookie(&self, subject: &str) -> Option<String> {
        let expires_at = self.clock.now_millis() + self.config.ttl_ms;
        let (slot, key) = self.ring.active_key();
        match codec::encode(subject, expires_at, slot, key.server_id(), &key) {
            Ok(value) => Some(value),
            Err(e) => {
                error!("failed to encode token for {subject}: {e}");
                None
            }
        }
    }

    fn set_auth_cookie(&self, resp: &mut dyn TokenResponse, subject: &str) {
        let Some(value) = self.encode_cookie(subject) else {
            return;
        };
        resp.add_cookie(ResponseCookie {
            name: self.config.cookie_name.clone(),
            value,
            max_age_secs: None,
            secure: self.config.secure_cookie,
            http_only: true,
            path: "/".to_string(),
        });
        // rfc 2109 section 4.5: stop http 1.1 caches caching the response
        resp.add_header("Cache-Control", "no-cache=\"set-cookie\"");
        // and stop http 1.0 caches caching the response
        resp.add_header("Expires", "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    fn clear_cookie(&self, resp: &mut dyn TokenResponse) {
        resp.add_cookie(ResponseCookie {
            name: self.config.cookie_name.clone(),
            value: String::new(),
            max_age_secs: Some(0),
            secure: self.config.secure_cookie,
            http_only: true,
            path: "/".to_string(),
        });
    }
}
