//! Admin console
//!
//! Served by backends in Console mode, behind the same TLS termination
//! and client ACL as any other tenant. Endpoints:
//! - GET / - metrics page: events, per-backend counters, live connections
//! - GET /config - the active configuration, as YAML
//! - GET /favicon.ico

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::proxy::SharedState;

pub fn console_router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/", get(metrics_page))
        .route("/config", get(config_handler))
        .route("/favicon.ico", get(favicon_handler))
        .with_state(state)
}

async fn metrics_page(State(state): State<Arc<SharedState>>) -> Html<String> {
    let mut page = String::with_capacity(4096);
    page.push_str("<!DOCTYPE html><html><head><title>snigate</title>");
    page.push_str(
        "<style>body{font-family:monospace}table{border-collapse:collapse}\
         td,th{border:1px solid #999;padding:2px 8px;text-align:left}</style>",
    );
    page.push_str("</head><body><h1>snigate</h1>");
    let _ = writeln!(
        page,
        "<p>started {}; open connections: {}</p>",
        state.started_at().format("%Y-%m-%d %H:%M:%S UTC"),
        state.open_connections(),
    );

    page.push_str("<h2>Backends</h2><table><tr><th>backend</th><th>connections</th><th>recv</th><th>sent</th></tr>");
    for m in state.metrics.snapshot() {
        let _ = writeln!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&m.backend),
            m.connections,
            m.bytes_received,
            m.bytes_sent,
        );
    }
    page.push_str("</table>");

    page.push_str("<h2>Events</h2><table><tr><th>event</th><th>count</th></tr>");
    for (event, count) in state.events.snapshot() {
        let _ = writeln!(
            page,
            "<tr><td>{}</td><td>{}</td></tr>",
            escape(&event),
            count
        );
    }
    page.push_str("</table>");

    page.push_str(
        "<h2>Connections</h2><table><tr><th>peer</th><th>server name</th>\
         <th>mode</th><th>age</th><th>recv</th><th>sent</th></tr>",
    );
    for c in state.connections_snapshot() {
        let _ = writeln!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:?}</td><td>{}</td><td>{}</td></tr>",
            escape(&c.peer),
            escape(&c.server_name),
            escape(&c.mode),
            c.age,
            c.bytes_received,
            c.bytes_sent,
        );
    }
    page.push_str("</table></body></html>");
    Html(page)
}

async fn config_handler(State(state): State<Arc<SharedState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.config_yaml().await,
    )
        .into_response()
}

async fn favicon_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
