//! Request rewriting for the two inbound shapes.
//!
//! Each route has a fixed pipeline of field edits applied to the raw request
//! body. Required edits propagate their error and abort the request; optional
//! cleanup edits are logged and skipped.

pub mod chat;
pub mod code;
pub mod field;

pub use field::Payload;

use crate::config::{ModelFamily, Route, RouteConfig};
use crate::error::Result;

/// Run the pipeline that belongs to `route` over `payload`.
pub fn rewrite(payload: &mut Payload, route: &RouteConfig) -> Result<()> {
    match route.family {
        ModelFamily::Chat => chat::rewrite_chat(payload, route),
        _ => code::rewrite_code(payload, route),
    }
}

/// Best-effort removal; a failure leaves the payload as it was.
pub(crate) fn drop_optional(payload: &mut Payload, field: &str, route: Route) {
    if let Err(e) = payload.delete(field) {
        tracing::warn!(route = %route, field, error = %e, "Failed to drop field");
    }
}

/// Lower `max_tokens` to `ceiling` when it is present and larger.
pub(crate) fn clamp_max_tokens(payload: &mut Payload, ceiling: i64) -> Result<()> {
    if payload.count("max_tokens")? > ceiling {
        payload.set("max_tokens", ceiling)?;
    }
    Ok(())
}
