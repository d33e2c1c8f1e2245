//! Network-level batching for the Gmail batch endpoint.
//!
//! A batch is one `multipart/mixed` POST whose parts are complete HTTP
//! requests. It saves round trips, not quota: every inner `messages.get`
//! still costs its full quota units.

use std::time::Duration;

use crate::error::{ProviderError, Result};
use crate::retry::parse_retry_after;

/// Hard limit on requests per batch imposed by the API.
pub const MAX_BATCH_SIZE: usize = 100;

/// Quota units per call, from the Gmail API usage limits table.
pub mod quota {
    pub const MESSAGES_GET: u32 = 5;
    pub const MESSAGES_LIST: u32 = 5;
    pub const GET_PROFILE: u32 = 1;
    /// Per-user rate limit, in units per second.
    pub const PER_USER_UNITS_PER_SECOND: u32 = 250;
}

/// Quota units consumed by fetching `messages` messages, however they are
/// batched.
pub fn estimate_get_quota(messages: usize) -> u64 {
    messages as u64 * u64::from(quota::MESSAGES_GET)
}

/// Shortest time in which `messages` fetches fit under the per-user rate.
pub fn min_fetch_duration(messages: usize) -> Duration {
    let units = estimate_get_quota(messages);
    let per_second = u64::from(quota::PER_USER_UNITS_PER_SECOND);
    Duration::from_millis(units * 1000 / per_second)
}

/// Split `ids` into chunks of at most `limit` (itself clamped to
/// [`MAX_BATCH_SIZE`]).
pub fn chunk_ids(ids: &[String], limit: usize) -> std::slice::Chunks<'_, String> {
    ids.chunks(limit.clamp(1, MAX_BATCH_SIZE))
}

/// One inner request of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    /// Path and query relative to the API host, e.g.
    /// `/gmail/v1/users/me/messages/abc?format=metadata`.
    pub path: String,
}

/// An encoded batch request body.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub boundary: String,
    pub body: String,
    pub len: usize,
}

impl BatchRequest {
    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.boundary)
    }
}

/// Encode `items` as a multipart/mixed body of GET requests. Parts carry
/// `Content-ID: <item-N>` so responses can be matched by index.
pub fn build_batch(items: &[BatchItem]) -> Result<BatchRequest> {
    if items.is_empty() || items.len() > MAX_BATCH_SIZE {
        return Err(ProviderError::InvalidConfig {
            reason: format!(
                "batch must hold 1..={MAX_BATCH_SIZE} requests, got {}",
                items.len()
            ),
        });
    }

    let boundary = format!("batch_{}", uuid::Uuid::new_v4().simple());
    let mut body = String::new();
    for (i, item) in items.iter().enumerate() {
        body.push_str(&format!("--{boundary}\r\n"));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str(&format!("Content-ID: <item-{i}>\r\n\r\n"));
        body.push_str(&format!("GET {}\r\n\r\n", item.path));
    }
    body.push_str(&format!("--{boundary}--\r\n"));

    Ok(BatchRequest {
        boundary,
        body,
        len: items.len(),
    })
}

/// One inner response of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPart {
    /// Index of the request this answers.
    pub index: usize,
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl BatchPart {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_error(self, id: &str) -> ProviderError {
        if self.status == 404 {
            return ProviderError::NotFound { id: id.to_string() };
        }
        ProviderError::from_status(self.status, self.retry_after, &self.body)
    }
}

/// Pull the `boundary` parameter out of a multipart content type.
fn boundary_of(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Split `text` into its header block and the remainder at the first blank
/// line. A leading blank line means an empty header block.
fn split_head(text: &str) -> (&str, &str) {
    if let Some(rest) = text.strip_prefix('\n') {
        return ("", rest);
    }
    match text.find("\n\n") {
        Some(pos) => (&text[..pos], &text[pos + 2..]),
        None => (text, ""),
    }
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// `<response-item-7>` -> 7.
fn index_of(content_id: &str) -> Option<usize> {
    let id = content_id.trim().trim_start_matches('<').trim_end_matches('>');
    id.rsplit('-').next()?.parse().ok()
}

/// Parse a multipart/mixed batch response into its parts.
///
/// Parts without a usable `Content-ID` take their position in the body.
pub fn parse_batch_response(content_type: &str, body: &str) -> Result<Vec<BatchPart>> {
    let boundary = boundary_of(content_type).ok_or_else(|| ProviderError::MalformedBatch {
        reason: format!("no boundary in content type {content_type:?}"),
    })?;
    let delimiter = format!("--{boundary}");
    let body = body.replace("\r\n", "\n");
    let now = chrono::Utc::now();

    let mut parts = Vec::new();
    // Everything before the first delimiter is preamble.
    for (position, segment) in body.split(delimiter.as_str()).skip(1).enumerate() {
        if segment.starts_with("--") {
            break;
        }
        let segment = segment.strip_prefix('\n').unwrap_or(segment);
        let (outer_head, http) = split_head(segment);
        let index = header(outer_head, "content-id")
            .and_then(index_of)
            .unwrap_or(position);

        let (inner_head, inner_body) = split_head(http);
        let status_line = inner_head.lines().next().unwrap_or_default();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| ProviderError::MalformedBatch {
                reason: format!("bad status line {status_line:?} in part {position}"),
            })?;
        let retry_after = header(inner_head, "retry-after").and_then(|v| parse_retry_after(v, now));

        parts.push(BatchPart {
            index,
            status,
            retry_after,
            body: inner_body.trim().to_string(),
        });
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("m{i}")).collect()
    }

    #[test]
    fn chunking_respects_hard_limit() {
        let ids = ids(250);
        let sizes: Vec<usize> = chunk_ids(&ids, 100).map(<[String]>::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        let sizes: Vec<usize> = chunk_ids(&ids, 500).map(<[String]>::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        let sizes: Vec<usize> = chunk_ids(&ids[..5], 2).map(<[String]>::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn quota_is_not_reduced_by_batching() {
        assert_eq!(estimate_get_quota(250), 1250);
        assert_eq!(min_fetch_duration(250), Duration::from_secs(5));
    }

    #[test]
    fn builds_multipart_body() {
        let req = build_batch(&[
            BatchItem {
                path: "/gmail/v1/users/me/messages/a?format=metadata".into(),
            },
            BatchItem {
                path: "/gmail/v1/users/me/messages/b?format=metadata".into(),
            },
        ])
        .unwrap();

        assert_eq!(req.len, 2);
        assert!(req.content_type().starts_with("multipart/mixed; boundary=batch_"));
        assert!(req.body.contains("Content-ID: <item-1>\r\n\r\nGET /gmail/v1/users/me/messages/b?format=metadata\r\n"));
        assert!(req.body.ends_with(&format!("--{}--\r\n", req.boundary)));
        assert_eq!(req.body.matches("Content-Type: application/http").count(), 2);
    }

    #[test]
    fn rejects_empty_and_oversized_batches() {
        assert!(build_batch(&[]).is_err());
        let items = vec![BatchItem { path: "/x".into() }; MAX_BATCH_SIZE + 1];
        assert!(build_batch(&items).is_err());
    }

    #[test]
    fn parses_google_style_response() {
        let body = "--batch_xyz\r\n\
Content-Type: application/http\r\n\
Content-ID: <response-item-1>\r\n\
\r\n\
HTTP/1.1 404 Not Found\r\n\
Content-Type: application/json; charset=UTF-8\r\n\
\r\n\
{\"error\": {\"code\": 404, \"message\": \"Requested entity was not found.\"}}\r\n\
--batch_xyz\r\n\
Content-Type: application/http\r\n\
Content-ID: <response-item-0>\r\n\
\r\n\
HTTP/1.1 200 OK\r\n\
Content-Type: application/json; charset=UTF-8\r\n\
\r\n\
{\"id\": \"a\", \"threadId\": \"t\"}\r\n\
--batch_xyz\r\n\
Content-Type: application/http\r\n\
Content-ID: <response-item-2>\r\n\
\r\n\
HTTP/1.1 429 Too Many Requests\r\n\
Retry-After: 3\r\n\
\r\n\
{}\r\n\
--batch_xyz--\r\n";

        let parts = parse_batch_response("multipart/mixed; boundary=batch_xyz", body).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!((parts[0].index, parts[0].status), (1, 404));
        assert_eq!((parts[1].index, parts[1].status), (0, 200));
        assert_eq!(parts[1].body, "{\"id\": \"a\", \"threadId\": \"t\"}");
        assert_eq!(parts[2].retry_after, Some(Duration::from_secs(3)));

        assert!(matches!(parts[0].clone().into_error("b"), ProviderError::NotFound { .. }));
        assert!(parts[2].clone().into_error("c").is_retryable());
    }

    #[test]
    fn quoted_boundary_and_missing_content_id() {
        let body = "preamble\n--b1\n\nHTTP/1.1 200 OK\n\n{}\n--b1--\n";
        let parts = parse_batch_response("multipart/mixed; boundary=\"b1\"", body).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].index, 0);
        assert_eq!(parts[0].body, "{}");
    }

    #[test]
    fn missing_boundary_is_malformed() {
        let err = parse_batch_response("application/json", "{}").unwrap_err();
        assert!(matches!(err, ProviderError::MalformedBatch { .. }));
    }
}
