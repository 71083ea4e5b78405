//! Mapping of scraping actor dataset items into company details and photo groups.

use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use crate::constants::{
    DEFAULT_ACTOR_COUNTRY, MAX_ADDRESS_LEN, MAX_CATEGORY_LEN, MAX_EMAIL_LEN, MAX_INTRO_LEN, MAX_PHONE_LEN,
    MAX_TITLE_LEN,
};
use crate::types::CompanyDetails;

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Top-level field, falling back to the `userData` echoed back by the actor.
fn tagged(item: &Value, key: &str) -> Option<String> {
    text(item.get(key)).or_else(|| text(item.get("userData").and_then(|u| u.get(key))))
}

fn truncated(item: &Value, key: &str, max_chars: usize) -> Option<String> {
    text(item.get(key)).map(|s| s.chars().take(max_chars).collect())
}

/// First letter upper-cased, the rest lower-cased.
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Page records without a numeric `id_scraping` are dropped.
pub fn company_details(items: &[Value]) -> Vec<CompanyDetails> {
    items
        .iter()
        .filter_map(|item| {
            let id = tagged(item, "id_scraping")?;
            if !id.chars().all(|c| c.is_ascii_digit()) {
                warn!("Dropping page record with non-numeric id_scraping {:?}", id);
                return None;
            }
            let country = tagged(item, "country").unwrap_or_else(|| DEFAULT_ACTOR_COUNTRY.to_string());
            Some(CompanyDetails {
                id_scraping: id,
                facebook_url: text(item.get("facebookUrl")),
                address: truncated(item, "address", MAX_ADDRESS_LEN),
                category: truncated(item, "category", MAX_CATEGORY_LEN),
                email: truncated(item, "email", MAX_EMAIL_LEN),
                intro: truncated(item, "intro", MAX_INTRO_LEN),
                phone: truncated(item, "phone", MAX_PHONE_LEN),
                title: truncated(item, "title", MAX_TITLE_LEN),
                profile_picture_url: text(item.get("profilePictureUrl")),
                cover_photo_url: text(item.get("coverPhotoUrl")),
                country: capitalize(&country),
            })
        })
        .collect()
}

/// Photo URLs grouped by `facebookUrl`, each group in dataset order.
pub fn group_photos(items: &[Value]) -> HashMap<String, Vec<String>> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for item in items {
        let Some(page) = text(item.get("facebookUrl")) else { continue };
        let Some(image) = text(item.get("image")) else { continue };
        grouped.entry(page).or_default().push(image);
    }
    grouped
}
