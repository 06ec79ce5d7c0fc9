//! Path-based connection routing.
//!
//! Each WebSocket upgrade carries a path that selects a handler and a
//! query string that parameterizes it. Routing is exact-match only; an
//! unknown path closes the connection immediately. Handler failures are
//! absorbed here so nothing a single connection does can reach the
//! accept loop.

use std::collections::HashMap;

use crate::connection::WsStream;
use crate::handlers;
use crate::state::AppState;

/// The registered connection endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// PTY-backed interactive shell.
    Shell,
    /// Assistant CLI sessions.
    Assistant,
    /// Dev-server control and log streaming.
    DevServer,
}

impl Route {
    pub fn parse(path: &str) -> Option<Route> {
        match path {
            "/shell" => Some(Route::Shell),
            "/ws" => Some(Route::Assistant),
            "/devserver" => Some(Route::DevServer),
            _ => None,
        }
    }
}

/// Per-connection context threaded through every handler: a short
/// correlation id for tracing plus the parsed upgrade query.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub correlation: String,
    pub path: String,
    pub query: HashMap<String, String>,
}

impl ConnectionContext {
    pub fn new(path: &str, query: Option<&str>) -> Self {
        Self {
            correlation: bosun_common::new_correlation_id(),
            path: path.to_string(),
            query: parse_query(query),
        }
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

/// Dispatch one upgraded connection to its handler. An unknown path is
/// logged and dropped; the stream closes when `ws` does.
pub async fn route(ws: WsStream, path: &str, query: Option<&str>, state: AppState) {
    let ctx = ConnectionContext::new(path, query);
    let route = match Route::parse(path) {
        Some(route) => route,
        None => {
            tracing::warn!(conn = %ctx.correlation, path = %path, "unknown route, closing");
            return;
        }
    };

    tracing::info!(conn = %ctx.correlation, path = %path, "connection routed");
    match route {
        Route::Shell => handlers::shell::handle(ws, ctx, state).await,
        Route::Assistant => handlers::assistant::handle(ws, ctx, state).await,
        Route::DevServer => handlers::devserver::handle(ws, ctx, state).await,
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return HashMap::new();
    };
    // The url crate handles percent-decoding; the base is throwaway.
    match url::Url::parse(&format!("ws://localhost/?{query}")) {
        Ok(url) => url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "unparseable query string");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_paths_resolve() {
        assert_eq!(Route::parse("/shell"), Some(Route::Shell));
        assert_eq!(Route::parse("/ws"), Some(Route::Assistant));
        assert_eq!(Route::parse("/devserver"), Some(Route::DevServer));
    }

    #[test]
    fn unknown_and_inexact_paths_do_not_resolve() {
        assert_eq!(Route::parse("/"), None);
        assert_eq!(Route::parse("/shell/extra"), None);
        assert_eq!(Route::parse("/Shell"), None);
        assert_eq!(Route::parse("/metrics"), None);
    }

    #[test]
    fn context_parses_query_pairs() {
        let ctx = ConnectionContext::new("/shell", Some("cols=120&rows=40&cwd=%2Ftmp%2Fapp"));
        assert_eq!(ctx.query_param("cols"), Some("120"));
        assert_eq!(ctx.query_param("rows"), Some("40"));
        assert_eq!(ctx.query_param("cwd"), Some("/tmp/app"));
        assert_eq!(ctx.query_param("missing"), None);
        assert_eq!(ctx.correlation.len(), 8);
    }

    #[test]
    fn empty_query_is_fine() {
        let ctx = ConnectionContext::new("/ws", None);
        assert!(ctx.query.is_empty());
        let ctx = ConnectionContext::new("/ws", Some(""));
        assert!(ctx.query.is_empty());
    }
}
