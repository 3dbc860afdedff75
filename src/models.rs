//! Model listing served on `/models` and `/v1/models`.
//!
//! The listing is computed once at startup from configuration: every model the
//! proxy can route to, in OpenAI list format.

use crate::config::ServiceConfig;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelListing {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

impl ModelListing {
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        let mut ids = BTreeSet::new();
        ids.insert(config.chat.model_default.clone());
        ids.extend(config.chat.model_map.keys().cloned());
        ids.insert(config.code.model.clone());

        let data = ids
            .into_iter()
            .filter(|id| !id.is_empty())
            .map(|id| ModelEntry {
                id,
                object: "model",
                owned_by: "copilot-override",
            })
            .collect();

        Self {
            object: "list",
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_includes_chat_and_code_models() {
        let config = ServiceConfig::parse(
            r#"
[chat]
model_default = "qwen-turbo"

[chat.model_map]
"gpt-4" = "qwen-max"
"gpt-3.5-turbo" = "qwen-turbo"

[code]
model = "stable-code-3b"
"#,
        )
        .unwrap();

        let listing = ModelListing::from_config(&config);
        let ids: Vec<&str> = listing.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["gpt-3.5-turbo", "gpt-4", "qwen-turbo", "stable-code-3b"]);
        assert_eq!(listing.object, "list");
    }
}
