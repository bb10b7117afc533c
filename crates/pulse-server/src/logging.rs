//! Request logging middleware: one colored line per request with a
//! 16-hex-char trace ID, method, path, status, and elapsed time.
//!
//! Credential-bearing paths are logged without their query string and
//! never with a body.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use rand::Rng;
use std::fmt::Write;
use std::time::Instant;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const MAGENTA: &str = "\x1b[35m";
const BLUE: &str = "\x1b[34m";
const GRAY: &str = "\x1b[90m";
const RESET: &str = "\x1b[0m";

fn generate_trace_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let mut s = String::with_capacity(16);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn method_color(method: &axum::http::Method) -> &'static str {
    match method.as_str() {
        "GET" => GREEN,
        "POST" => CYAN,
        "PUT" => YELLOW,
        "DELETE" => RED,
        "PATCH" => MAGENTA,
        _ => BLUE,
    }
}

fn format_elapsed(elapsed_us: u128) -> String {
    let (time_str, color) = if elapsed_us < 1000 {
        (format!("{elapsed_us}µs"), GREEN)
    } else if elapsed_us < 1_000_000 {
        (format!("{}ms", elapsed_us / 1000), GREEN)
    } else {
        (format!("{:.1}s", elapsed_us as f64 / 1_000_000.0), RED)
    };
    format!("{color}{time_str}{RESET}")
}

fn is_sensitive(path: &str) -> bool {
    path.starts_with("/api/config/nodes")
        || path.starts_with("/api/config/export")
        || path.starts_with("/api/config/import")
}

pub async fn request_logging(req: Request, next: Next) -> Response {
    let trace_id = generate_trace_id();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();

    let url = match uri.query() {
        Some(query) if !is_sensitive(&path) => format!("{path}?{query}"),
        _ => path,
    };

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed_us = start.elapsed().as_micros();
    let status = response.status();

    let status_color = if status.is_success() {
        GREEN
    } else if status.is_client_error() {
        YELLOW
    } else {
        RED
    };
    let mc = method_color(&method);
    println!(
        "{GRAY}[{trace_id}]{RESET} {mc}{method}{RESET} {url} {status_color}{status}{RESET} {}",
        format_elapsed(elapsed_us)
    );

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert("X-Trace-Id", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_16_hex_chars() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn credential_paths_are_sensitive() {
        assert!(is_sensitive("/api/config/nodes"));
        assert!(is_sensitive("/api/config/nodes/abc123"));
        assert!(is_sensitive("/api/config/export"));
        assert!(!is_sensitive("/api/state"));
    }
}
