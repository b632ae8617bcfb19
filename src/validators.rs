//! Input validation for values that end up in kernel rules
//!
//! Rule ids are embedded in iptables comments and nftables rule comments so
//! they can be found again on delete. They are validated here before any
//! command is built.

use ipnetwork::IpNetwork;

/// Maximum rule id length. Kernel comments allow 256 bytes; the tag adds a prefix.
pub const MAX_RULE_ID_LEN: usize = 64;

/// Validates a rule id.
///
/// SECURITY: ASCII-only so ids cannot smuggle quotes, whitespace or shell
/// metacharacters into tool arguments or comments.
///
/// # Errors
///
/// Returns `Err` if the id is empty, longer than [`MAX_RULE_ID_LEN`], or
/// contains characters other than ASCII alphanumerics and `- _ . :`.
///
/// # Examples
///
/// ```
/// use hostwall::validators::validate_rule_id;
///
/// assert!(validate_rule_id("sg-web:443").is_ok());
/// assert!(validate_rule_id("bad id").is_err());
/// ```
pub fn validate_rule_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("Rule id cannot be empty".to_string());
    }

    if id.len() > MAX_RULE_ID_LEN {
        return Err(format!("Rule id too long (max {MAX_RULE_ID_LEN} characters)"));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err("Rule id contains invalid characters".to_string());
    }

    Ok(())
}

/// Validates a `port`/`port_end` pair.
///
/// `port = 0` means not port-scoped, `port_end = 0` means a single port.
///
/// # Errors
///
/// Returns `Err` if:
/// - `port_end` is set without `port`
/// - `port_end` is less than `port`
pub fn validate_port_range(port: u16, port_end: u16) -> Result<(), String> {
    if port == 0 && port_end != 0 {
        return Err("Port range end given without a start port".to_string());
    }

    if port_end != 0 && port_end < port {
        return Err("Start port must be less than or equal to end port".to_string());
    }

    Ok(())
}

/// Validates that source and destination networks share an address family.
///
/// # Errors
///
/// Returns `Err` if one side is IPv4 and the other IPv6.
pub fn validate_cidr_pair(source: Option<&IpNetwork>, dest: Option<&IpNetwork>) -> Result<(), String> {
    match (source, dest) {
        (Some(s), Some(d)) if s.is_ipv4() != d.is_ipv4() => {
            Err("Source and destination must be the same IP family".to_string())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_id_accepts_common_forms() {
        assert!(validate_rule_id("3f2b0c1e-9d7a-4c55-8e21-0a6f1b2c3d4e").is_ok());
        assert!(validate_rule_id("immutable-tcp-22").is_ok());
        assert!(validate_rule_id("block-2001:db8::_32").is_ok());
    }

    #[test]
    fn test_rule_id_rejects_injection() {
        assert!(validate_rule_id("a\"b").is_err());
        assert!(validate_rule_id("a;rm -rf").is_err());
        assert!(validate_rule_id("a\nb").is_err());
        assert!(validate_rule_id("").is_err());
        assert!(validate_rule_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_port_range() {
        assert!(validate_port_range(0, 0).is_ok());
        assert!(validate_port_range(22, 0).is_ok());
        assert!(validate_port_range(1000, 2000).is_ok());
        assert!(validate_port_range(80, 80).is_ok());
        assert!(validate_port_range(0, 80).is_err());
        assert!(validate_port_range(90, 80).is_err());
    }

    #[test]
    fn test_cidr_pair_family() {
        let v4: IpNetwork = "10.0.0.0/8".parse().unwrap();
        let v6: IpNetwork = "2001:db8::/32".parse().unwrap();
        assert!(validate_cidr_pair(Some(&v4), Some(&v4)).is_ok());
        assert!(validate_cidr_pair(Some(&v4), None).is_ok());
        assert!(validate_cidr_pair(Some(&v4), Some(&v6)).is_err());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_valid_ids_never_contain_dangerous_chars(input in "\\PC*") {
            if validate_rule_id(&input).is_ok() {
                prop_assert!(!input.contains('"'));
                prop_assert!(!input.contains('\''));
                prop_assert!(!input.contains(' '));
                prop_assert!(!input.contains('$'));
                prop_assert!(!input.contains(';'));
                prop_assert!(input.len() <= MAX_RULE_ID_LEN);
            }
        }

        #[test]
        fn test_port_range_ordering(port in any::<u16>(), end in any::<u16>()) {
            let result = validate_port_range(port, end);
            let expected = !(port == 0 && end != 0) && (end == 0 || end >= port);
            prop_assert_eq!(result.is_ok(), expected);
        }
    }
}
