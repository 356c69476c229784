//! Store key layout.
//!
//! A collection is every key sharing one prefix: `report_123` is member `123`
//! of collection `report_`. Derived values are republished under
//! `derived_{name}`.

pub const REPORT: &str = "report_";
pub const REPORT_ACTIONS: &str = "reportActions_";
pub const TRANSACTION: &str = "transactions_";
pub const TRANSACTION_VIOLATIONS: &str = "transactionViolations_";

/// Reserved namespace for engine-owned values.
pub const DERIVED_PREFIX: &str = "derived_";

/// Collections registered on every client store.
pub const COLLECTIONS: &[&str] = &[REPORT, REPORT_ACTIONS, TRANSACTION, TRANSACTION_VIOLATIONS];

/// Build a collection member key: `{collection}{id}`.
pub fn member_key(collection: &str, id: &str) -> String {
    let mut key = String::with_capacity(collection.len() + id.len());
    key.push_str(collection);
    key.push_str(id);
    key
}

/// Extract the member id from a collection member key.
/// Returns `None` if the key is not a member of `collection`.
pub fn member_id<'a>(collection: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(collection).filter(|id| !id.is_empty())
}

pub fn derived_key(name: &str) -> String {
    member_key(DERIVED_PREFIX, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_key_roundtrip() {
        let key = member_key(REPORT, "42");
        assert_eq!(key, "report_42");
        assert_eq!(member_id(REPORT, &key), Some("42"));
    }

    #[test]
    fn member_id_rejects_other_collections() {
        // `reportActions_1` shares the `report` stem but not the `report_` prefix.
        assert_eq!(member_id(REPORT, "reportActions_1"), None);
        assert_eq!(member_id(REPORT_ACTIONS, "reportActions_1"), Some("1"));
    }

    #[test]
    fn member_id_rejects_bare_prefix() {
        assert_eq!(member_id(REPORT, "report_"), None);
    }

    #[test]
    fn derived_keys_are_namespaced() {
        assert_eq!(derived_key("reportMetadata"), "derived_reportMetadata");
    }
}
