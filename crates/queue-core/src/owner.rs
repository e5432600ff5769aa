//! Owner-id normalization.
//!
//! Owner identifiers arriving from producers are not always UUIDs (an
//! upstream team slug, an account email, whatever the caller already had on
//! hand). The `owner_id` column is uniformly typed, so anything that isn't
//! already a UUID is hashed into one with a deterministic version-5 scheme
//! under a fixed namespace. This must be a total function, stable across
//! processes and restarts, no randomness, no clock.

use uuid::Uuid;

/// Fixed namespace for owner-id hashing. Never change this value: doing so
/// would silently re-bucket every non-UUID owner a deployment has ever seen.
pub const OWNER_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6a, 0x1d, 0x8f, 0x02, 0x3b, 0x44, 0x4e, 0x91, 0x9a, 0x7c, 0x51, 0x0d, 0x2e, 0x88, 0xaf, 0x3e,
]);

/// Normalize a raw owner identifier into a UUID.
///
/// If `raw` already parses as a UUID it is returned unchanged (case- and
/// hyphenation-insensitive, per [`Uuid::parse_str`]). Otherwise it is hashed
/// via [`Uuid::new_v5`] under [`OWNER_NAMESPACE`].
pub fn normalize_owner_id(raw: &str) -> Uuid {
    Uuid::parse_str(raw).unwrap_or_else(|_| Uuid::new_v5(&OWNER_NAMESPACE, raw.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_existing_uuids() {
        let id = Uuid::new_v4();
        assert_eq!(normalize_owner_id(&id.to_string()), id);
    }

    #[test]
    fn is_deterministic_for_non_uuid_owners() {
        let a = normalize_owner_id("team-acme");
        let b = normalize_owner_id("team-acme");
        assert_eq!(a, b);
    }

    #[test]
    fn distinguishes_different_owners() {
        assert_ne!(normalize_owner_id("team-acme"), normalize_owner_id("team-other"));
    }

    #[test]
    fn produces_version_5_uuids_for_hashed_owners() {
        let id = normalize_owner_id("not-a-uuid-at-all");
        assert_eq!(id.get_version_num(), 5);
    }
}
