//! Canonical sender identity and allow-list evaluation.
//!
//! A canonical ID is `{platform}:{platform_id}` with the platform lowercased,
//! so the same human maps to the same string across gateway restarts.

/// Build the canonical cross-restart identity for a platform user.
pub fn canonical_id(platform: &str, platform_id: &str) -> String {
    format!("{}:{}", platform.to_lowercase(), platform_id)
}

/// Evaluate an allow-from list against a sender.
///
/// An empty list permits everyone. Otherwise the sender matches on either the
/// canonical ID or the raw platform ID — the latter keeps allow-lists written
/// before canonical IDs existed working.
pub fn is_allowed(allow_from: &[String], canonical: &str, platform_id: &str) -> bool {
    if allow_from.is_empty() {
        return true;
    }
    allow_from
        .iter()
        .any(|entry| entry == canonical || entry == platform_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_id_lowercases_platform_only() {
        assert_eq!(canonical_id("WhatsApp", "AbC123"), "whatsapp:AbC123");
    }

    #[test]
    fn canonical_id_is_idempotent_on_its_parts() {
        let id = canonical_id("telegram", "42");
        let (platform, rest) = id.split_once(':').unwrap();
        assert_eq!(canonical_id(platform, rest), id);
    }

    #[test]
    fn empty_allow_list_permits_everyone() {
        assert!(is_allowed(&[], "telegram:42", "42"));
    }

    #[test]
    fn matches_canonical_id() {
        let list = vec!["telegram:42".to_string()];
        assert!(is_allowed(&list, "telegram:42", "42"));
    }

    #[test]
    fn matches_raw_platform_id() {
        let list = vec!["42".to_string()];
        assert!(is_allowed(&list, "telegram:42", "42"));
    }

    #[test]
    fn rejects_unlisted_sender() {
        let list = vec!["telegram:42".to_string()];
        assert!(!is_allowed(&list, "telegram:43", "43"));
    }

    #[test]
    fn exact_match_only_no_substrings() {
        let list = vec!["telegram:42".to_string()];
        assert!(!is_allowed(&list, "telegram:420", "420"));
        assert!(!is_allowed(&list, "telegram:4", "4"));
    }
}
