//! ID types used across stackd.

use crate::prefixed_id;

prefixed_id!(
    /// Identifies one stack for its whole lifetime, including after it is terminal.
    StackId,
    "stk"
);

prefixed_id!(
    /// Correlates log lines and error bodies for a single API request.
    RequestId,
    "req"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_display_uses_prefix() {
        let id = StackId::new();
        let s = id.to_string();
        assert!(s.starts_with("stk_"));
        assert_eq!(s.len(), 4 + 26);
    }

    #[test]
    fn test_parse_rejects_wrong_prefix() {
        let req = RequestId::new().to_string();
        let err = StackId::parse(&req).unwrap_err();
        assert!(matches!(err, IdError::InvalidPrefix { expected: "stk", .. }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(StackId::parse(""), Err(IdError::Empty));
        assert_eq!(StackId::parse("stk"), Err(IdError::MissingSeparator));
        assert!(matches!(
            StackId::parse("stk_not-a-ulid"),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_dns_label_is_lowercase_and_recoverable() {
        let id = StackId::new();
        let label = id.dns_label();
        assert!(label.starts_with("stk-"));
        assert_eq!(label, label.to_ascii_lowercase());
        assert_eq!(StackId::from_dns_label(&label).unwrap(), id);
    }

    #[test]
    fn test_serde_as_string() {
        let id = StackId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: StackId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    proptest! {
        #[test]
        fn prop_parse_accepts_any_case(raw in any::<u128>()) {
            let id = StackId::from_ulid(crate::Ulid::from(raw));
            let lower = id.to_string().replacen(
                &id.ulid().to_string(),
                &id.ulid().to_string().to_ascii_lowercase(),
                1,
            );
            prop_assert_eq!(StackId::parse(&lower).unwrap(), id);
        }
    }
}
