//! Access logging with header allow/block-list filtering (§4.6). Headers
//! are compared case-insensitively via `http::HeaderName`'s own canonical
//! form rather than `UniCase` (the teacher's choice), since axum/hyper
//! headers are already `HeaderName`s by the time we see them here.

use std::time::Instant;

use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode};
use tracing::{event, Level};

use crate::config::HeaderFilter;

#[derive(Clone)]
pub struct AccessLogger {
    disabled: bool,
    level: Level,
    request_headers: HeaderFilter,
    response_headers: HeaderFilter,
}

impl AccessLogger {
    pub fn new(config: &crate::config::AccessLogConfig) -> Self {
        let level = config
            .level
            .as_deref()
            .and_then(|l| l.parse().ok())
            .unwrap_or(Level::INFO);
        Self {
            disabled: config.disable,
            level,
            request_headers: config.request_headers.clone(),
            response_headers: config.response_headers.clone(),
        }
    }

    pub fn start(&self) -> AccessLogEntry {
        AccessLogEntry {
            start: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn log(
        &self,
        entry: AccessLogEntry,
        method: &Method,
        path: &str,
        endpoint_id: &str,
        status: StatusCode,
        request_headers: &HeaderMap,
        response_headers: &HeaderMap,
    ) {
        if self.disabled {
            return;
        }
        let latency_ms = entry.start.elapsed().as_millis();
        let started_at = entry.started_at.to_rfc3339();
        let req_headers = filter_headers(request_headers, &self.request_headers);
        let resp_headers = filter_headers(response_headers, &self.response_headers);

        match self.level {
            Level::ERROR => event!(Level::ERROR, %method, path, endpoint_id, status = status.as_u16(), latency_ms, %started_at, ?req_headers, ?resp_headers, "access"),
            Level::WARN => event!(Level::WARN, %method, path, endpoint_id, status = status.as_u16(), latency_ms, %started_at, ?req_headers, ?resp_headers, "access"),
            Level::DEBUG => event!(Level::DEBUG, %method, path, endpoint_id, status = status.as_u16(), latency_ms, %started_at, ?req_headers, ?resp_headers, "access"),
            Level::TRACE => event!(Level::TRACE, %method, path, endpoint_id, status = status.as_u16(), latency_ms, %started_at, ?req_headers, ?resp_headers, "access"),
            Level::INFO => event!(Level::INFO, %method, path, endpoint_id, status = status.as_u16(), latency_ms, %started_at, ?req_headers, ?resp_headers, "access"),
        }
    }
}

pub struct AccessLogEntry {
    start: Instant,
    started_at: DateTime<Utc>,
}

/// An allow-list, if non-empty, is exclusive: only the named headers pass.
/// Otherwise the block-list is subtractive: everything passes except the
/// named headers.
fn filter_headers(headers: &HeaderMap, filter: &HeaderFilter) -> Vec<(String, String)> {
    let allow: Vec<String> = filter.allow_list.iter().map(|h| h.to_lowercase()).collect();
    let block: Vec<String> = filter.block_list.iter().map(|h| h.to_lowercase()).collect();

    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str().to_lowercase();
            if !allow.is_empty() {
                allow.contains(&name)
            } else {
                !block.contains(&name)
            }
        })
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn allow_list_is_exclusive() {
        let filter = HeaderFilter {
            allow_list: vec!["content-type".to_string()],
            block_list: vec![],
        };
        let headers = headers_with(&[("content-type", "text/plain"), ("authorization", "secret")]);
        let filtered = filter_headers(&headers, &filter);
        assert_eq!(filtered, vec![("content-type".to_string(), "text/plain".to_string())]);
    }

    #[test]
    fn block_list_is_subtractive() {
        let filter = HeaderFilter {
            allow_list: vec![],
            block_list: vec!["authorization".to_string()],
        };
        let headers = headers_with(&[("content-type", "text/plain"), ("authorization", "secret")]);
        let filtered = filter_headers(&headers, &filter);
        assert_eq!(filtered, vec![("content-type".to_string(), "text/plain".to_string())]);
    }

    #[test]
    fn header_names_compared_case_insensitively() {
        let filter = HeaderFilter {
            allow_list: vec!["Content-Type".to_string()],
            block_list: vec![],
        };
        let headers = headers_with(&[("content-type", "text/plain")]);
        assert_eq!(filter_headers(&headers, &filter).len(), 1);
    }
}
