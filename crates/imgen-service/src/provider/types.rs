//! Wire types of the Kie-style jobs API and the mapping to
//! [`NormalizedStatus`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{NormalizedStatus, ProviderError};

/// Envelope `code` of a successful call.
pub const CODE_OK: i64 = 200;

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /api/v1/jobs/createTask`.
#[derive(Debug, Serialize)]
pub struct CreateTaskRequest<'a> {
    /// Model name.
    pub model: &'a str,
    /// Where the provider pushes the final status.
    #[serde(rename = "callBackUrl", skip_serializing_if = "Option::is_none")]
    pub call_back_url: Option<&'a str>,
    /// Generation parameters.
    pub input: TaskInput<'a>,
}

/// Generation parameters of a task.
#[derive(Debug, Serialize)]
pub struct TaskInput<'a> {
    /// Text prompt.
    pub prompt: &'a str,
    /// Reference image URLs.
    pub image_input: &'a [String],
    /// e.g. `"16:9"`.
    pub aspect_ratio: &'static str,
    /// `"1K"`, `"2K"` or `"4K"`.
    pub resolution: &'static str,
    /// `"png"` or `"jpg"`.
    pub output_format: &'static str,
}

// ============================================================================
// Responses
// ============================================================================

/// Common response envelope.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T> {
    /// Provider status code, 200 on success.
    #[serde(default = "default_code")]
    pub code: i64,
    /// Human readable message.
    #[serde(default)]
    pub msg: Option<String>,
    /// Payload.
    #[serde(default)]
    pub data: Option<T>,
}

const fn default_code() -> i64 {
    CODE_OK
}

impl<T> Envelope<T> {
    /// Unwrap the payload of a successful envelope.
    ///
    /// # Errors
    ///
    /// A non-200 code is classified the way HTTP statuses are. A missing
    /// payload is an error too.
    pub fn into_data(self) -> Result<T, ProviderError> {
        if self.code != CODE_OK {
            let msg = self.msg.unwrap_or_else(|| format!("code {}", self.code));
            return Err(classify_code(self.code, msg));
        }
        self.data
            .ok_or_else(|| ProviderError::Unavailable("response has no data".into()))
    }
}

/// Map an HTTP status or envelope code to a gateway error.
#[must_use]
pub fn classify_code(code: i64, message: String) -> ProviderError {
    match code {
        429 => ProviderError::RateLimited(message),
        400..=499 => ProviderError::InvalidRequest(message),
        _ => ProviderError::Unavailable(message),
    }
}

/// `data` of a createTask response.
#[derive(Debug, Deserialize)]
pub struct CreateTaskData {
    /// Provider task id.
    #[serde(rename = "taskId")]
    pub task_id: String,
}

/// `data` of a recordInfo response, also the body of a callback.
#[derive(Debug, Deserialize)]
pub struct RecordInfo {
    /// Provider task id.
    #[serde(rename = "taskId")]
    pub task_id: String,
    /// Provider state string.
    #[serde(default)]
    pub state: ProviderTaskState,
    /// Usually a JSON document encoded as a string.
    #[serde(rename = "resultJson", default)]
    pub result_json: Option<Value>,
    /// Failure code, string or number depending on the endpoint.
    #[serde(rename = "failCode", default)]
    pub fail_code: Option<Value>,
    /// Failure message.
    #[serde(rename = "failMsg", default)]
    pub fail_msg: Option<String>,
}

/// Provider task states as they appear on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTaskState {
    /// Accepted.
    Waiting,
    /// Queued behind other work.
    Queuing,
    /// Rendering.
    Generating,
    /// Rendering.
    Processing,
    /// Finished with a result.
    Success,
    /// Finished without a result.
    Fail,
    /// Finished without a result.
    Failed,
    /// Anything this client does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

impl RecordInfo {
    /// Map the wire record onto the internal vocabulary.
    ///
    /// `success` without an extractable result URL stays `processing`, and
    /// unknown states never become terminal.
    #[must_use]
    pub fn normalize(&self) -> NormalizedStatus {
        match self.state {
            ProviderTaskState::Waiting | ProviderTaskState::Queuing => NormalizedStatus::waiting(),
            ProviderTaskState::Generating
            | ProviderTaskState::Processing
            | ProviderTaskState::Unknown => NormalizedStatus::processing(),
            ProviderTaskState::Success => match extract_result_url(self.result_json.as_ref()) {
                Some(url) => NormalizedStatus::success(url),
                None => {
                    tracing::debug!(
                        task_id = %self.task_id,
                        "Provider reported success without a usable result, treating as pending"
                    );
                    NormalizedStatus::processing()
                }
            },
            ProviderTaskState::Fail | ProviderTaskState::Failed => {
                NormalizedStatus::failed(self.failure_detail())
            }
        }
    }

    fn failure_detail(&self) -> String {
        let code = self.fail_code.as_ref().and_then(|code| match code {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        match (code, self.fail_msg.as_deref()) {
            (Some(code), Some(msg)) => format!("{code}: {msg}"),
            (None, Some(msg)) => msg.to_string(),
            (Some(code), None) => code,
            (None, None) => "provider reported failure".to_string(),
        }
    }
}

/// Pull the first result URL out of `resultJson`.
///
/// The field is normally a string holding a JSON document, so it takes a
/// second parse. Anything unparseable yields `None`.
#[must_use]
pub fn extract_result_url(result_json: Option<&Value>) -> Option<String> {
    let mut doc = result_json?.clone();
    // Unwrap at most two layers of string encoding.
    for _ in 0..2 {
        match doc {
            Value::String(raw) => doc = serde_json::from_str(&raw).ok()?,
            _ => break,
        }
    }

    let url = doc
        .get("resultUrls")?
        .as_array()?
        .iter()
        .find_map(Value::as_str)?;

    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Some(url.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::NormalizedState;
    use serde_json::json;

    fn record(value: Value) -> RecordInfo {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn nested_result_json_is_parsed_twice() {
        let info = record(json!({
            "taskId": "t1",
            "state": "success",
            "resultJson": "{\"resultUrls\":[\"https://x/y.png\"]}"
        }));
        assert_eq!(info.normalize(), NormalizedStatus::success("https://x/y.png"));
    }

    #[test]
    fn result_json_as_object_is_accepted() {
        let info = record(json!({
            "taskId": "t1",
            "state": "success",
            "resultJson": { "resultUrls": ["https://cdn.example.com/a.jpg"] }
        }));
        assert_eq!(
            info.normalize().result_ref.as_deref(),
            Some("https://cdn.example.com/a.jpg")
        );
    }

    #[test]
    fn unparseable_result_is_pending_not_terminal() {
        let results = [
            json!("{not json"),
            json!("{\"resultUrls\":[]}"),
            json!("{\"resultUrls\":[\"nope\"]}"),
        ];
        for result in results {
            let info = record(json!({
                "taskId": "t1",
                "state": "success",
                "resultJson": result
            }));
            assert_eq!(info.normalize().state, NormalizedState::Processing);
        }
    }

    #[test]
    fn unknown_and_missing_states_map_to_processing() {
        let info = record(json!({ "taskId": "t1", "state": "teleporting" }));
        assert_eq!(info.state, ProviderTaskState::Unknown);
        assert_eq!(info.normalize().state, NormalizedState::Processing);

        let info = record(json!({ "taskId": "t1" }));
        assert_eq!(info.normalize().state, NormalizedState::Processing);
    }

    #[test]
    fn state_vocabulary() {
        let cases = [
            ("waiting", NormalizedState::Waiting),
            ("queuing", NormalizedState::Waiting),
            ("generating", NormalizedState::Processing),
            ("processing", NormalizedState::Processing),
            ("fail", NormalizedState::Failed),
            ("failed", NormalizedState::Failed),
        ];
        for (raw, expected) in cases {
            let info = record(json!({ "taskId": "t1", "state": raw }));
            assert_eq!(info.normalize().state, expected, "state {raw}");
        }
    }

    #[test]
    fn failure_detail_combines_code_and_message() {
        let info = record(json!({
            "taskId": "t1",
            "state": "fail",
            "failCode": 500,
            "failMsg": "content policy"
        }));
        assert_eq!(
            info.normalize().error_detail.as_deref(),
            Some("500: content policy")
        );
    }

    #[test]
    fn envelope_codes_are_classified() {
        let env: Envelope<CreateTaskData> =
            serde_json::from_value(json!({ "code": 429, "msg": "busy" })).unwrap();
        assert_eq!(
            env.into_data().unwrap_err(),
            ProviderError::RateLimited("busy".into())
        );

        let env: Envelope<CreateTaskData> =
            serde_json::from_value(json!({ "code": 422, "msg": "bad aspect" })).unwrap();
        assert!(matches!(env.into_data(), Err(ProviderError::InvalidRequest(_))));

        let env: Envelope<CreateTaskData> =
            serde_json::from_value(json!({ "code": 500 })).unwrap();
        assert!(matches!(env.into_data(), Err(ProviderError::Unavailable(_))));
    }
}
