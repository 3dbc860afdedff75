//! Rewrite rules for the code-completion route.

use super::field::Payload;
use super::{clamp_max_tokens, drop_optional};
use crate::config::{ModelFamily, RouteConfig};
use crate::error::Result;

/// Vendor metadata the downstream completion API has no use for.
const VENDOR_FIELDS: &[&str] = &["extra", "nwo"];

pub fn rewrite_code(payload: &mut Payload, route: &RouteConfig) -> Result<()> {
    for field in VENDOR_FIELDS {
        drop_optional(payload, field, route.route);
    }

    payload.set("model", route.model.resolve(None))?;
    clamp_max_tokens(payload, route.max_tokens)?;

    match route.family {
        ModelFamily::FillInMiddleCode => fill_in_middle(payload),
        ModelFamily::SingleSampleCode => single_sample(payload),
        ModelFamily::PassthroughCode | ModelFamily::Chat => Ok(()),
    }
}

/// Wrap `prompt`/`suffix` in FIM markers as a single user message.
fn fill_in_middle(payload: &mut Payload) -> Result<()> {
    let prompt = payload.get_str("prompt")?.unwrap_or_default();
    let suffix = payload.get_str("suffix")?.unwrap_or_default();
    let content = format!("<fim_prefix>{prompt}<fim_suffix>{suffix}<fim_middle>");

    payload.set(
        "messages",
        serde_json::json!([{ "role": "user", "content": content }]),
    )?;
    payload.unescape_angle_brackets();
    Ok(())
}

fn single_sample(payload: &mut Payload) -> Result<()> {
    if payload.count("n")? > 1 {
        payload.set("n", 1)?;
    }
    Ok(())
}
