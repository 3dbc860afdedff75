//! Rewrite rules for the chat route.

use super::field::Payload;
use super::{clamp_max_tokens, drop_optional};
use crate::config::RouteConfig;
use crate::error::Result;

/// Substring that marks a message as already carrying the locale instruction.
pub const LOCALE_MARKER: &str = "Respond in the following locale";

/// Vendor intent-classification fields the downstream API rejects.
const INTENT_FIELDS: &[&str] = &["intent", "intent_threshold", "intent_content"];

/// Apply the chat pipeline: model mapping, locale hint, intent cleanup, token clamp.
pub fn rewrite_chat(payload: &mut Payload, route: &RouteConfig) -> Result<()> {
    let inbound = payload.get_str("model")?;
    let model = route.model.resolve(inbound.as_deref());
    payload.set("model", model)?;

    inject_locale(payload, &route.locale)?;

    for field in INTENT_FIELDS {
        drop_optional(payload, field, route.route);
    }

    clamp_max_tokens(payload, route.max_tokens)
}

/// Append the locale instruction to the last message unless a function call is
/// in flight or the instruction is already there.
fn inject_locale(payload: &mut Payload, locale: &str) -> Result<()> {
    if payload.exists("function_call")? {
        return Ok(());
    }

    let Some(serde_json::Value::Array(messages)) = payload.get("messages")? else {
        return Ok(());
    };
    let Some(last_index) = messages.len().checked_sub(1) else {
        return Ok(());
    };

    let content = match messages[last_index].get("content") {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(_) => {
            tracing::debug!("Last message content is not text, skipping locale hint");
            return Ok(());
        }
    };
    if content.contains(LOCALE_MARKER) {
        return Ok(());
    }

    let path = format!("messages.{last_index}.content");
    payload.set(&path, format!("{content}{LOCALE_MARKER}: {locale}."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelFamily, ModelMapping, ModelSelection, Route};
    use crate::error::ProxyError;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    fn chat_route() -> RouteConfig {
        let mut mapping = HashMap::new();
        mapping.insert("gpt-4".to_string(), "qwen-max".to_string());
        RouteConfig {
            route: Route::Chat,
            base_url: "https://chat.example.com/v1".to_string(),
            api_key: "key".to_string(),
            organization: None,
            project: None,
            max_tokens: 1024,
            model: ModelSelection::Mapped(ModelMapping {
                mapping,
                default: "qwen-turbo".to_string(),
            }),
            locale: "en_US".to_string(),
            family: ModelFamily::Chat,
        }
    }

    fn run(body: Value) -> Value {
        let mut payload = Payload::new(serde_json::to_vec(&body).unwrap());
        rewrite_chat(&mut payload, &chat_route()).unwrap();
        serde_json::from_slice(payload.as_bytes()).unwrap()
    }

    #[test]
    fn test_mapped_model() {
        let out = run(json!({"model": "gpt-4", "messages": []}));
        assert_eq!(out["model"], "qwen-max");
    }

    #[test]
    fn test_unmapped_or_missing_model_uses_default() {
        assert_eq!(run(json!({"model": "gpt-4o", "messages": []}))["model"], "qwen-turbo");
        assert_eq!(run(json!({"messages": []}))["model"], "qwen-turbo");
        assert_eq!(run(json!({"model": 4, "messages": []}))["model"], "qwen-turbo");
    }

    #[test]
    fn test_locale_appended_to_last_message() {
        let out = run(json!({
            "model": "gpt-4",
            "messages": [
                {"role": "system", "content": "You are helpful."},
                {"role": "user", "content": "Explain this code."}
            ]
        }));
        assert_eq!(out["messages"][0]["content"], "You are helpful.");
        assert_eq!(
            out["messages"][1]["content"],
            "Explain this code.Respond in the following locale: en_US."
        );
    }

    #[test]
    fn test_locale_injection_is_idempotent() {
        let once = run(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let twice = run(once.clone());
        assert_eq!(once["messages"], twice["messages"]);
    }

    #[test]
    fn test_function_call_skips_locale() {
        let out = run(json!({
            "function_call": "auto",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(out["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_empty_or_missing_messages_skip_locale() {
        let out = run(json!({"messages": []}));
        assert_eq!(out["messages"], json!([]));
        let out = run(json!({"prompt": "x"}));
        assert!(out.get("messages").is_none());
    }

    #[test]
    fn test_missing_content_gets_locale_only() {
        let out = run(json!({"messages": [{"role": "user"}]}));
        assert_eq!(
            out["messages"][0]["content"],
            "Respond in the following locale: en_US."
        );
    }

    #[test]
    fn test_content_parts_left_untouched() {
        let parts = json!([{"type": "text", "text": "hi"}]);
        let out = run(json!({"messages": [{"role": "user", "content": parts.clone()}]}));
        assert_eq!(out["messages"][0]["content"], parts);
    }

    #[test]
    fn test_intent_fields_stripped() {
        let out = run(json!({
            "messages": [],
            "intent": true,
            "intent_threshold": 0.7,
            "intent_content": "x",
            "temperature": 0.1
        }));
        assert!(out.get("intent").is_none());
        assert!(out.get("intent_threshold").is_none());
        assert!(out.get("intent_content").is_none());
        assert_eq!(out["temperature"], 0.1);
    }

    #[test]
    fn test_max_tokens_clamp() {
        assert_eq!(run(json!({"messages": [], "max_tokens": 8192}))["max_tokens"], 1024);
        assert_eq!(run(json!({"messages": [], "max_tokens": 1024}))["max_tokens"], 1024);
        assert_eq!(run(json!({"messages": [], "max_tokens": 10}))["max_tokens"], 10);
        assert!(run(json!({"messages": []})).get("max_tokens").is_none());
    }

    #[test]
    fn test_malformed_body_is_required_edit_failure() {
        let mut payload = Payload::new(b"not json".to_vec());
        let err = rewrite_chat(&mut payload, &chat_route()).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedPayload { .. }));
    }
}
