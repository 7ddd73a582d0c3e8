//! Model discovery (`GET /api/tags`).

use serde::{Deserialize, Serialize};

/// Capability family that marks a model as vision-capable.
const VISION_FAMILY: &str = "clip";

/// A model installed on the inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    /// Capability families reported by the server (e.g. `llama`, `clip`).
    pub families: Vec<String>,
}

impl ModelInfo {
    pub fn is_vision_capable(&self) -> bool {
        self.families.iter().any(|f| f.contains(VISION_FAMILY))
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    details: Option<TagDetails>,
}

#[derive(Deserialize)]
struct TagDetails {
    #[serde(default)]
    families: Option<Vec<String>>,
}

/// Parse a `/api/tags` response body.
pub fn parse_tags(body: &str) -> Result<Vec<ModelInfo>, serde_json::Error> {
    let tags: TagsResponse = serde_json::from_str(body)?;
    Ok(tags
        .models
        .into_iter()
        .map(|entry| ModelInfo {
            name: entry.name,
            families: entry
                .details
                .and_then(|d| d.families)
                .unwrap_or_default(),
        })
        .collect())
}

/// First vision-capable model in server order, if any.
pub fn default_vision_model(models: &[ModelInfo]) -> Option<&ModelInfo> {
    models.iter().find(|m| m.is_vision_capable())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        let models = parse_tags(
            r#"{"models":[
                {"name":"llama3:8b","size":1,"details":{"family":"llama","families":["llama"]}},
                {"name":"bakllava:latest","details":{"families":["llama","clip"]}},
                {"name":"llava:13b","details":{"families":["clip"]}},
                {"name":"bare"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(models.len(), 4);
        assert_eq!(models[3].families, Vec::<String>::new());
        assert_eq!(default_vision_model(&models).unwrap().name, "bakllava:latest");
    }

    #[test]
    fn test_null_families() {
        let models = parse_tags(r#"{"models":[{"name":"m","details":{"families":null}}]}"#).unwrap();
        assert!(models[0].families.is_empty());
        assert!(default_vision_model(&models).is_none());
    }

    #[test]
    fn test_empty_and_missing_list() {
        assert!(parse_tags(r#"{"models":[]}"#).unwrap().is_empty());
        assert!(parse_tags("{}").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_body() {
        assert!(parse_tags("<html>").is_err());
    }
}
