//! Capability path tokens.

use uuid::Uuid;

/// Generate a fresh capability path token.
///
/// The token has no structure beyond uniqueness and unguessability; it is
/// an ephemeral per-establishment secret, never persisted.
#[must_use]
pub fn generate_caps_path() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Full capability seed URL for a caps path on a region's public HTTP
/// server.
#[must_use]
pub fn full_caps_seed_url(http_uri: &str, caps_path: &str) -> String {
    format!("{}/CAPS/{}0000/", http_uri.trim_end_matches('/'), caps_path)
}
