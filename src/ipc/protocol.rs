use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Success {
        #[serde(default)]
        data: Value,
    },
    Error {
        error: Value,
    },
}

impl Response {
    pub fn ok() -> Response { Response::Success { data: json!({}) } }

    pub fn success(data: Value) -> Response { Response::Success { data } }

    pub fn error(message: impl Into<String>) -> Response {
        Response::Error { error: Value::String(message.into()) }
    }

    pub fn is_success(&self) -> bool { matches!(self, Response::Success { .. }) }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_request_without_data() {
        let request: Request =
            serde_json::from_str(r#"{"method":"live_previews/release_output"}"#).unwrap();
        assert_eq!(request.method, "live_previews/release_output");
        assert_eq!(request.data, Value::Null);
    }

    #[test]
    fn test_response_wire_shape() {
        assert_eq!(
            serde_json::to_value(Response::ok()).unwrap(),
            json!({ "result": "success", "data": {} })
        );
        assert_eq!(
            serde_json::to_value(Response::error("no such view")).unwrap(),
            json!({ "result": "error", "error": "no such view" })
        );
    }
}
