//! Shared User-Agent string for all outbound HTTP traffic.
//!
//! Catalog scraping and dataset downloads go through the same client, so the
//! remote repositories see one consistent, identifiable agent.

/// Tool description included in the User-Agent.
const UA_COMMENT: &str = "scientific-data-cache";

/// Default User-Agent (identifies the service and its version).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("datalink/{version} ({UA_COMMENT})")
}
