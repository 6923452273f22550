//! Authentication state for HTTP and headless fetchers: bearer token,
//! extra headers, cookies, and an optional refresh hook invoked on 401.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Values a refresh callback may replace.
#[derive(Debug, Clone, Default)]
pub struct AuthRefresh {
    pub bearer_token: Option<String>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
}

pub type RefreshFn = Arc<dyn Fn() -> AuthRefresh + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct AuthState {
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
    bearer_token: Option<String>,
}

/// Container for authentication headers/cookies and optional refresh.
/// Interior-mutable so a refresh can update credentials mid-session.
#[derive(Default)]
pub struct AuthSession {
    state: RwLock<AuthState>,
    refresh: Option<RefreshFn>,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bearer_token(token: impl Into<String>) -> Self {
        let session = Self::new();
        if let Ok(mut state) = session.state.write() {
            state.bearer_token = Some(token.into());
        }
        session
    }

    pub fn with_headers(headers: HashMap<String, String>) -> Self {
        let session = Self::new();
        if let Ok(mut state) = session.state.write() {
            state.headers = headers;
        }
        session
    }

    /// Parse a raw `Cookie:` header value into a session.
    pub fn from_cookie_header(raw: &str) -> Self {
        let mut cookies = HashMap::new();
        for part in raw.split(';') {
            if let Some((name, value)) = part.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    cookies.insert(name.to_string(), value.trim().to_string());
                }
            }
        }
        let session = Self::new();
        if let Ok(mut state) = session.state.write() {
            state.cookies = cookies;
        }
        session
    }

    pub fn with_refresh(mut self, refresh: RefreshFn) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn has_refresh(&self) -> bool {
        self.refresh.is_some()
    }

    /// Merge this session's credentials into an outgoing header list.
    /// Existing Authorization/Cookie headers set by the caller win.
    pub fn apply_headers(&self, headers: &mut Vec<(String, String)>) {
        let Ok(state) = self.state.read() else {
            return;
        };

        if let Some(token) = &state.bearer_token {
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("authorization")) {
                headers.push(("Authorization".to_string(), format!("Bearer {token}")));
            }
        }
        for (k, v) in &state.headers {
            headers.retain(|(name, _)| !name.eq_ignore_ascii_case(k));
            headers.push((k.clone(), v.clone()));
        }
        if !state.cookies.is_empty()
            && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("cookie"))
        {
            let cookie = state
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.push(("Cookie".to_string(), cookie));
        }
    }

    /// Cookie name/value pairs for the headless renderer.
    pub fn cookie_pairs(&self) -> Vec<(String, String)> {
        self.state
            .read()
            .map(|s| s.cookies.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Invoke the refresh callback, if any, and fold its result back in.
    pub fn refresh_now(&self) {
        let Some(refresh) = &self.refresh else {
            return;
        };
        let updated = refresh();
        match self.state.write() {
            Ok(mut state) => {
                if let Some(token) = updated.bearer_token {
                    state.bearer_token = Some(token);
                }
                state.headers.extend(updated.headers);
                state.cookies.extend(updated.cookies);
            }
            Err(e) => warn!("auth refresh could not take the state lock: {e}"),
        }
    }
}
