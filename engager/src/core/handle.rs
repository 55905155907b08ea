//! Target handle derivation for the secondary message step.

use regex::Regex;

use crate::core::types::WorkItem;

/// Default pattern: the path segment after `/in/` of a profile link.
pub const DEFAULT_HANDLE_PATTERN: &str = r"/in/([^/?#]+)";

/// Extract the counterparty handle from the item's profile link using the
/// first capture group of `pattern`.
pub fn derive_handle(pattern: &Regex, item: &WorkItem) -> Result<String, String> {
    let url = item
        .profile_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| format!("item '{}' has no profile link", item.item_id))?;
    let handle = pattern
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|handle| !handle.is_empty())
        .ok_or_else(|| format!("cannot derive handle from '{url}'"))?;
    Ok(handle.to_string())
}
