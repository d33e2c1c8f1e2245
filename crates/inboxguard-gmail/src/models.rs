//! Gmail API resources, as returned by the REST endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use inboxguard_auth::PartialOutcome;

/// `users.getProfile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub email_address: String,
    #[serde(default)]
    pub messages_total: u64,
    #[serde(default)]
    pub threads_total: u64,
    #[serde(default)]
    pub history_id: Option<String>,
}

/// A message as returned by `users.messages.get`.
///
/// The MIME payload is kept as raw JSON; interpreting it is up to the
/// caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub history_id: Option<String>,
    /// Milliseconds since the epoch, as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub size_estimate: Option<u64>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl EmailMessage {
    /// Value of the first payload header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .get("headers")?
            .as_array()?
            .iter()
            .find(|h| {
                h.get("name")
                    .and_then(|n| n.as_str())
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })?
            .get("value")?
            .as_str()
    }
}

/// Filters for `users.messages.list`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQuery {
    /// Gmail search syntax, e.g. `is:unread newer_than:7d`.
    pub q: Option<String>,
    pub label_ids: Vec<String>,
    pub include_spam_trash: bool,
    /// Stop after this many ids. `None` follows every page.
    pub limit: Option<usize>,
}

/// One page of `users.messages.list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListPage {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageRef {
    pub id: String,
}

/// Result of a batched fetch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageBatch {
    /// Fetched messages, in request order.
    pub messages: Vec<EmailMessage>,
    /// Per-id success accounting.
    pub outcome: PartialOutcome,
    /// Ids that could not be fetched, with the reason.
    pub failures: BTreeMap<String, String>,
    /// HTTP round trips used, including retries.
    pub dispatches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_deserializes_from_api_shape() {
        let msg: EmailMessage = serde_json::from_str(
            r#"{
                "id": "18c2f",
                "threadId": "18c2e",
                "labelIds": ["INBOX", "UNREAD"],
                "snippet": "Your invoice",
                "internalDate": "1700000000000",
                "payload": {"headers": [{"name": "Subject", "value": "Invoice #42"}]}
            }"#,
        )
        .unwrap();
        assert_eq!(msg.thread_id.as_deref(), Some("18c2e"));
        assert_eq!(msg.label_ids, vec!["INBOX", "UNREAD"]);
        assert_eq!(msg.header("subject"), Some("Invoice #42"));
        assert_eq!(msg.header("From"), None);
    }

    #[test]
    fn empty_list_page() {
        let page: ListPage = serde_json::from_str(r#"{"resultSizeEstimate": 0}"#).unwrap();
        assert!(page.messages.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
