//! Completion event DTOs

use serde::{Deserialize, Serialize};

/// Body of `POST {control}/events/{job_runner_id}`
///
/// `runner_id` is optional on the wire; events without it are counted but
/// cannot be deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub runner_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_event_body() {
        let event: CompletionEvent =
            serde_json::from_str(r#"{"success": true, "message": "done"}"#).unwrap();
        assert!(event.success);
        assert_eq!(event.message, "done");
        assert_eq!(event.runner_id, None);
    }
}
