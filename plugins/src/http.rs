//! Shared reqwest plumbing: every failure leaves here as a [`ClassifiedError`].

use harvest_core::api::ClassifiedError;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub(crate) const BODY_PREVIEW_LIMIT: usize = 512;

pub(crate) fn build_client(timeout_ms: u64) -> anyhow::Result<reqwest::Client> {
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .build()?;
    Ok(http)
}

pub(crate) fn preview_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    let mut out = String::new();
    let mut truncated = false;
    for (idx, ch) in trimmed.chars().enumerate() {
        if idx >= BODY_PREVIEW_LIMIT {
            truncated = true;
            break;
        }
        out.push(ch);
    }

    if truncated {
        out.push_str("...");
    }

    out
}

/// Transport failures are network errors; a bad request builder is a
/// configuration error.
pub(crate) fn from_reqwest(err: reqwest::Error, url: &str) -> ClassifiedError {
    if let Some(status) = err.status() {
        return ClassifiedError::http(status.as_u16(), format!("{url}: {err}"));
    }
    if err.is_builder() {
        return ClassifiedError::configuration(format!("invalid request to {url}: {err}"));
    }
    if err.is_decode() {
        return ClassifiedError::application(format!("undecodable body from {url}: {err}"));
    }
    ClassifiedError::network(format!("{url}: {err}"))
}

/// A 2xx body that still reports failure, e.g. `{"ok": false, "msg": "login required"}`.
fn application_failure(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    if let Some(err) = obj.get("error") {
        match err {
            Value::Null | Value::Bool(false) => {}
            Value::String(s) if s.trim().is_empty() => {}
            Value::String(s) => return Some(s.clone()),
            other => return Some(other.to_string()),
        }
    }
    if obj.get("ok") == Some(&Value::Bool(false)) {
        let msg = obj
            .get("msg")
            .or_else(|| obj.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("request reported failure");
        return Some(msg.to_string());
    }
    None
}

/// Read the body, classify non-2xx statuses and application failures, then decode.
pub(crate) async fn parse_json_response<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ClassifiedError> {
    let status = resp.status();
    let url = resp.url().to_string();
    let body = resp.text().await.map_err(|err| from_reqwest(err, &url))?;

    if !status.is_success() {
        return Err(ClassifiedError::http(
            status.as_u16(),
            format!("{url}: {}", preview_body(&body)),
        ));
    }

    let value = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str::<Value>(&body).map_err(|err| {
            ClassifiedError::application(format!(
                "failed to decode response body from {url}: {err} | body={}",
                preview_body(&body)
            ))
        })?
    };

    if let Some(message) = application_failure(&value) {
        return Err(ClassifiedError::application(message));
    }

    serde_json::from_value(value).map_err(|err| {
        ClassifiedError::application(format!("unexpected response shape from {url}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::api::{ErrorKind, HttpClass};
    use serde_json::json;

    #[test]
    fn preview_body_empty() {
        assert_eq!(preview_body("   "), "<empty body>");
    }

    #[test]
    fn preview_body_truncates() {
        let body = "a".repeat(BODY_PREVIEW_LIMIT + 10);
        let preview = preview_body(&body);
        assert!(preview.ends_with("..."));
        assert!(preview.len() <= BODY_PREVIEW_LIMIT + 3);
    }

    #[test]
    fn application_failure_shapes() {
        assert_eq!(
            application_failure(&json!({"error": "quota"})).as_deref(),
            Some("quota")
        );
        assert_eq!(
            application_failure(&json!({"ok": false, "msg": "login required"})).as_deref(),
            Some("login required")
        );
        assert_eq!(application_failure(&json!({"error": null, "items": []})), None);
        assert_eq!(application_failure(&json!([1, 2])), None);
    }

    #[tokio::test]
    async fn status_and_payload_failures_are_classified() {
        let mut server = mockito::Server::new_async().await;
        let _a = server
            .mock("GET", "/down")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;
        let _b = server
            .mock("GET", "/expired")
            .with_status(200)
            .with_body(r#"{"ok": false, "msg": "session expired"}"#)
            .create_async()
            .await;

        let http = build_client(1_000).unwrap();

        let resp = http.get(format!("{}/down", server.url())).send().await.unwrap();
        let err = parse_json_response::<Value>(resp).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Http(HttpClass::ServerError));
        assert_eq!(err.status, Some(503));
        assert!(err.message.contains("maintenance"));

        let resp = http
            .get(format!("{}/expired", server.url()))
            .send()
            .await
            .unwrap();
        let err = parse_json_response::<Value>(resp).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
    }
}
