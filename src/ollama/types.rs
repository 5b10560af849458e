use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    pub stream: bool,
}

/// One line of the `/api/generate` response. With `stream: false` the whole
/// answer arrives as a single chunk with `done = true`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelTag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelTag {
    pub name: String,
}

/// `llama3` matches `llama3:latest`; an explicit tag must match exactly.
pub fn model_matches(available: &str, requested: &str) -> bool {
    if available == requested {
        return true;
    }
    match available.split_once(':') {
        Some((base, "latest")) => !requested.contains(':') && base == requested,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_chunk_deserialize() {
        let line = r#"{"model":"llama3","created_at":"2024-01-01T00:00:00Z","response":"Hel","done":false}"#;
        let chunk: GenerateChunk = serde_json::from_str(line).expect("should parse");
        assert_eq!(chunk.response, "Hel");
        assert!(!chunk.done);
        assert!(chunk.eval_count.is_none());
    }

    #[test]
    fn test_final_chunk_carries_eval_count() {
        let line = r#"{"model":"llama3","response":"","done":true,"eval_count":57,"eval_duration":123}"#;
        let chunk: GenerateChunk = serde_json::from_str(line).expect("should parse");
        assert!(chunk.done);
        assert_eq!(chunk.eval_count, Some(57));
    }

    #[test]
    fn test_error_chunk() {
        let chunk: GenerateChunk =
            serde_json::from_str(r#"{"error":"model 'nope' not found"}"#).expect("should parse");
        assert_eq!(chunk.error.as_deref(), Some("model 'nope' not found"));
    }

    #[test]
    fn test_tags_deserialize() {
        let json = r#"{"models":[{"name":"llama3:latest","size":4661224676},{"name":"gemma2:9b"}]}"#;
        let tags: TagsResponse = serde_json::from_str(json).expect("should parse");
        assert_eq!(tags.models.len(), 2);
        assert_eq!(tags.models[1].name, "gemma2:9b");
    }

    #[test]
    fn test_request_omits_missing_system() {
        let req = GenerateRequest {
            model: "m",
            prompt: "p",
            system: None,
            stream: true,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("system").is_none());
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_model_matches() {
        assert!(model_matches("llama3:latest", "llama3"));
        assert!(model_matches("llama3:latest", "llama3:latest"));
        assert!(model_matches("gemma2:9b", "gemma2:9b"));
        assert!(!model_matches("gemma2:9b", "gemma2"));
        assert!(!model_matches("llama3:latest", "llama3:8b"));
    }
}
