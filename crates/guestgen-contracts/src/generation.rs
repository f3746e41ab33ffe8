use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// One item of a batch submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub size: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, size: Option<&str>) -> Self {
        Self {
            prompt: prompt.into(),
            size: size.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    pub session_id: String,
    pub artifact_url: String,
    pub prompt: String,
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Succeeded(GenerationResult),
    Failed { prompt: String, error: String },
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn prompt(&self) -> &str {
        match self {
            Self::Succeeded(result) => &result.prompt,
            Self::Failed { prompt, .. } => prompt,
        }
    }

    /// `{success: true, ...result}` or `{success: false, prompt, error}`.
    pub fn to_json(&self) -> Value {
        let mut row = Map::new();
        match self {
            Self::Succeeded(result) => {
                row.insert("success".to_string(), Value::Bool(true));
                if let Ok(Value::Object(fields)) = serde_json::to_value(result) {
                    row.extend(fields);
                }
            }
            Self::Failed { prompt, error } => {
                row.insert("success".to_string(), Value::Bool(false));
                row.insert("prompt".to_string(), Value::String(prompt.clone()));
                row.insert("error".to_string(), Value::String(error.clone()));
            }
        }
        Value::Object(row)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{BatchOutcome, GenerationRequest, GenerationResult};

    #[test]
    fn batch_outcome_json_shapes() {
        let ok = BatchOutcome::Succeeded(GenerationResult {
            session_id: "abc123".to_string(),
            artifact_url: "https://cdn.example.com/img/abc.png".to_string(),
            prompt: "a red bicycle".to_string(),
            size: "1:1".to_string(),
        });
        assert_eq!(
            ok.to_json(),
            json!({
                "success": true,
                "session_id": "abc123",
                "artifact_url": "https://cdn.example.com/img/abc.png",
                "prompt": "a red bicycle",
                "size": "1:1",
            })
        );

        let failed = BatchOutcome::Failed {
            prompt: "boat".to_string(),
            error: "rate limited".to_string(),
        };
        assert!(!failed.is_success());
        assert_eq!(failed.prompt(), "boat");
        assert_eq!(
            failed.to_json(),
            json!({"success": false, "prompt": "boat", "error": "rate limited"})
        );
    }

    #[test]
    fn generation_request_size_is_optional() -> anyhow::Result<()> {
        let rows: Vec<GenerationRequest> =
            serde_json::from_str(r#"[{"prompt": "cat"}, {"prompt": "dog", "size": "16:9"}]"#)?;
        assert_eq!(rows[0], GenerationRequest::new("cat", None));
        assert_eq!(rows[1], GenerationRequest::new("dog", Some("16:9")));
        Ok(())
    }
}
