//! HTTP status classification.
//!
//! Most non-200 statuses are normal outcomes for this API: 202 means the
//! server is still computing the result, 204 is a tombstone, and a 404 can
//! carry an `invalid` section naming ids the server recognizes but has no
//! data for. [`classify`] turns a status and body into a [`StatusOutcome`]
//! so the client can decide what to do without treating them as failures.

use serde_json::Value;

use crate::error::ApplicationError;

/// What a response means, before any normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    /// Data to normalize.
    Success(Value),
    /// Not ready yet; retry later.
    Delayed,
    /// The addressed records no longer exist.
    Deleted,
    /// The addressed ids are known but invalid; carries the `invalid` section.
    Invalid(Value),
    /// Plain not-found.
    NotFound,
    /// An application error for handlers or the user.
    Application(ApplicationError),
    /// Server fault or a status the caller did not expect.
    ServerFault { status: u16, message: String },
}

/// Extract `{ "error": {...} }` from a response body.
pub fn application_error(json: &Value) -> Option<ApplicationError> {
    let error = json.get("error")?;
    if !error.is_object() {
        return None;
    }
    serde_json::from_value(error.clone()).ok()
}

fn invalid_section(json: &Value) -> Option<&Value> {
    json.get("invalid").filter(|v| v.is_object())
}

fn fault_message(status: u16, json: &Value) -> String {
    if let Some(error) = application_error(json) {
        return error.to_string();
    }
    match json {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => format!("HTTP {}", status),
    }
}

/// Classify a response.
///
/// `expected` is the request's set of statuses treated as normal outcomes.
/// Application errors are recognized on any 4xx regardless of `expected`.
pub fn classify(status: u16, json: Value, expected: &[u16]) -> StatusOutcome {
    let expects = |s: u16| expected.contains(&s);

    match status {
        500..=u16::MAX => StatusOutcome::ServerFault {
            message: fault_message(status, &json),
            status,
        },
        404 if expects(404) => {
            if let Some(invalid) = invalid_section(&json) {
                return StatusOutcome::Invalid(invalid.clone());
            }
            match application_error(&json) {
                Some(error) if error.code.is_some() => StatusOutcome::Application(error),
                _ => StatusOutcome::NotFound,
            }
        }
        400..=499 => match application_error(&json) {
            Some(error) => StatusOutcome::Application(error),
            None => StatusOutcome::Application(ApplicationError {
                title: "Request failed".to_string(),
                message: fault_message(status, &json),
                code: None,
            }),
        },
        202 if expects(202) => StatusOutcome::Delayed,
        204 if expects(204) => StatusOutcome::Deleted,
        200..=299 if expects(status) => StatusOutcome::Success(json),
        _ => StatusOutcome::ServerFault {
            status,
            message: format!("unexpected status {}", status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DEFAULT_EXPECTED_STATUSES;
    use serde_json::json;
    use test_case::test_case;

    fn classify_default(status: u16, json: Value) -> StatusOutcome {
        classify(status, json, &DEFAULT_EXPECTED_STATUSES)
    }

    #[test_case(202, json!(null) => StatusOutcome::Delayed; "accepted is delayed")]
    #[test_case(204, json!(null) => StatusOutcome::Deleted; "no content is deleted")]
    #[test_case(404, json!(null) => StatusOutcome::NotFound; "plain not found")]
    #[test_case(404, json!({"error": {"title": "Not found", "message": "gone"}}) => StatusOutcome::NotFound; "not found without code")]
    #[test_case(201, json!({}) => StatusOutcome::ServerFault { status: 201, message: "unexpected status 201".into() }; "unexpected success status")]
    fn test_classify_simple(status: u16, json: Value) -> StatusOutcome {
        classify_default(status, json)
    }

    #[test]
    fn test_success_passes_body_through() {
        let body = json!({"branches": [{"id": 1}]});
        assert_eq!(
            classify_default(200, body.clone()),
            StatusOutcome::Success(body)
        );
    }

    #[test]
    fn test_404_with_invalid_body() {
        let body = json!({"invalid": {"branches": [3]}});
        assert_eq!(
            classify_default(404, body),
            StatusOutcome::Invalid(json!({"branches": [3]}))
        );
    }

    #[test_case(404; "not found with code")]
    #[test_case(400; "bad request")]
    #[test_case(403; "forbidden")]
    fn test_application_error_with_code(status: u16) {
        let body = json!({"error": {"title": "Invalid", "message": "bad", "code": "BAD_BRANCH_NAME"}});
        match classify_default(status, body) {
            StatusOutcome::Application(error) => {
                assert_eq!(error.code.as_deref(), Some("BAD_BRANCH_NAME"));
                assert_eq!(error.message, "bad");
            }
            other => panic!("expected application error, got {:?}", other),
        }
    }

    #[test]
    fn test_4xx_without_body() {
        match classify_default(409, Value::Null) {
            StatusOutcome::Application(error) => {
                assert_eq!(error.code, None);
                assert_eq!(error.message, "HTTP 409");
            }
            other => panic!("expected application error, got {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_404_is_application_error() {
        let outcome = classify(404, Value::Null, &[200]);
        assert!(matches!(outcome, StatusOutcome::Application(_)));
    }

    #[test]
    fn test_delayed_only_when_expected() {
        assert!(matches!(
            classify(202, Value::Null, &[200]),
            StatusOutcome::ServerFault { status: 202, .. }
        ));
    }

    #[test_case(500, json!({"error": {"title": "Oops", "message": "boom"}}) => "Oops: boom"; "error body")]
    #[test_case(502, json!("Bad Gateway") => "Bad Gateway"; "text body")]
    #[test_case(503, json!(null) => "HTTP 503"; "empty body")]
    fn test_server_fault_message(status: u16, json: Value) -> String {
        match classify_default(status, json) {
            StatusOutcome::ServerFault { message, .. } => message,
            other => panic!("expected server fault, got {:?}", other),
        }
    }
}
