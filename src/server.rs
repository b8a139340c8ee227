//! actix-web integration: adapters from actix requests/responses to the
//! service's [`TokenRequest`]/[`TokenResponse`] traits, plus a small set of
//! demo endpoints (login / me / logout) used by the binary.
//!
//! The adapter has no session backing; session-mode deployments plug their
//! own framework session into the traits.

use crate::service::{
    RequestCookie, ResponseCookie, TokenRequest, TokenResponse, TrustedTokenService,
};
use actix_web::cookie::{time::Duration as CookieDuration, Cookie};
use actix_web::{web, HttpRequest, HttpResponse, HttpResponseBuilder, Responder};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Shared application state for the demo endpoints.
pub struct AppState {
    pub service: Arc<TrustedTokenService>,
}

/// View of an actix request through the [`TokenRequest`] trait.
pub struct ActixTokenRequest<'a> {
    req: &'a HttpRequest,
    query: HashMap<String, String>,
    principal: Option<String>,
}

impl<'a> ActixTokenRequest<'a> {
    pub fn new(req: &'a HttpRequest) -> Self {
        Self::with_principal(req, None)
    }

    /// Wrap a request whose identity was already asserted upstream (the
    /// demo login endpoint's stand-in for an SSO wrapper).
    pub fn with_principal(req: &'a HttpRequest, principal: Option<String>) -> Self {
        let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
            .map(|q| q.into_inner())
            .unwrap_or_default();
        Self {
            req,
            query,
            principal,
        }
    }
}

impl TokenRequest for ActixTokenRequest<'_> {
    fn header(&self, name: &str) -> Option<String> {
        self.req
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    }

    fn parameter(&self, name: &str) -> Option<String> {
        self.query.get(name).cloned()
    }

    fn remote_addr(&self) -> Option<String> {
        self.req.peer_addr().map(|addr| addr.ip().to_string())
    }

    fn cookies(&self, name: &str) -> Vec<RequestCookie> {
        match self.req.cookies() {
            Ok(cookies) => cookies
                .iter()
                .filter(|c| c.name() == name)
                .map(|c| RequestCookie {
                    value: c.value().to_string(),
                    secure: c.secure(),
                })
                .collect(),
            Err(e) => {
                debug!("unparsable request cookies: {e}");
                Vec::new()
            }
        }
    }

    fn session_subject(&self) -> Option<String> {
        None
    }

    fn set_session_subject(&self, _subject: Option<String>) {}

    fn principal(&self) -> Option<String> {
        self.principal.clone()
    }
}

/// Collects cookies and headers during authentication and applies them to
/// an actix response builder afterwards.
#[derive(Default)]
pub struct ResponseSink {
    cookies: Vec<ResponseCookie>,
    headers: Vec<(String, String)>,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(self, builder: &mut HttpResponseBuilder) {
        for (name, value) in self.headers {
            builder.append_header((name, value));
        }
        for rc in self.cookies {
            let mut cookie = Cookie::build(rc.name, rc.value)
                .path(rc.path)
                .secure(rc.secure)
                .http_only(rc.http_only);
            if let Some(secs) = rc.max_age_secs {
                cookie = cookie.max_age(CookieDuration::seconds(secs));
            }
            builder.cookie(cookie.finish());
        }
    }
}

impl TokenResponse for ResponseSink {
    fn add_cookie(&mut self, cookie: ResponseCookie) {
        self.cookies.push(cookie);
    }

    fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }
}

/// POST /system/trustedauth/login?userid=...
///
/// Mints a trusted token for the asserted user. The `userid` parameter
/// stands in for an upstream SSO assertion; trusted-proxy headers and
/// parameters are honored per configuration.
async fn login(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let principal = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .ok()
        .and_then(|q| q.get("userid").cloned())
        .filter(|s| !s.trim().is_empty());

    let areq = ActixTokenRequest::with_principal(&req, principal);
    let mut sink = ResponseSink::new();
    match state.service.inject_token(&areq, &mut sink) {
        Some(subject) => {
            let mut builder = HttpResponse::Ok();
            sink.apply(&mut builder);
            builder.json(json!({ "user": subject }))
        }
        None => HttpResponse::BadRequest().json(json!({
            "error": "unable to determine user from request"
        })),
    }
}

/// GET /system/trustedauth/me
async fn me(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let areq = ActixTokenRequest::new(&req);
    let mut sink = ResponseSink::new();
    match state.service.authenticate(&areq, &mut sink) {
        Some(creds) => {
            let mut builder = HttpResponse::Ok();
            sink.apply(&mut builder);
            builder.json(json!({
                "subject": creds.subject,
                "source": format!("{:?}", creds.source),
            }))
        }
        None => {
            let mut builder = HttpResponse::Unauthorized();
            sink.apply(&mut builder);
            builder.json(json!({ "subject": "anonymous" }))
        }
    }
}

/// POST /system/trustedauth/logout
async fn logout(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let areq = ActixTokenRequest::new(&req);
    let mut sink = ResponseSink::new();
    state.service.drop_credentials(&areq, &mut sink);
    let mut builder = HttpResponse::Ok();
    sink.apply(&mut builder);
    builder.json(json!({ "ok": true }))
}

/// Register the demo endpoints.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/system/trustedauth")
            .route("/login", web::post().to(login))
            .route("/me", web::get().to(me))
            .route("/logout", web::post().to(logout)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySharedCache;
    use crate::config::TokenConfig;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use tempfile::tempdir;

    fn test_state(dir: &std::path::Path) -> web::Data<AppState> {
        let config = TokenConfig {
            snapshot_path: dir.join("keys.bin"),
            server_id: Some("server-a".to_string()),
            shared_secret: "server-test-secret".to_string(),
            ..TokenConfig::default()
        };
        let service =
            TrustedTokenService::new(config, Arc::new(MemorySharedCache::new())).unwrap();
        web::Data::new(AppState {
            service: Arc::new(service),
        })
    }

    #[actix_rt::test]
    async fn login_sets_cookie_and_me_accepts_it() {
        let dir = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(test_state(dir.path()))
                .configure(routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/system/trustedauth/login?userid=alice")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cookie = resp
            .response()
            .cookies()
            .find(|c| c.name() == "trustring-authn")
            .expect("login sets the auth cookie")
            .into_owned();
        assert_eq!(cookie.http_only(), Some(true));

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/system/trustedauth/me")
                .cookie(cookie)
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["subject"], "alice");
    }

    #[actix_rt::test]
    async fn me_without_cookie_is_anonymous() {
        let dir = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(test_state(dir.path()))
                .configure(routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/system/trustedauth/me")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn tampered_cookie_is_rejected_and_cleared() {
        let dir = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(test_state(dir.path()))
                .configure(routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/system/trustedauth/me")
                .cookie(Cookie::new("trustring-authn", "bad@token@bad@token"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let cleared = resp
            .response()
            .cookies()
            .find(|c| c.name() == "trustring-authn")
            .expect("invalid cookie is cleared");
        assert_eq!(cleared.max_age(), Some(CookieDuration::seconds(0)));
    }

    #[actix_rt::test]
    async fn login_without_user_is_a_bad_request() {
        let dir = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(test_state(dir.path()))
                .configure(routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/system/trustedauth/login")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn logout_clears_the_cookie() {
        let dir = tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(test_state(dir.path()))
                .configure(routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/system/trustedauth/logout")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp
            .response()
            .cookies()
            .any(|c| c.name() == "trustring-authn" && c.value().is_empty()));
    }
}
