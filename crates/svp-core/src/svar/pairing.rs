//! AP210 control/data channel naming.
//!
//! AP210 shares two variables per file: a control variable named `CTLxxx` or
//! `Cnnn` and its data variable `DATxxx` or `Dnnn` (`nnn` all digits). The
//! long prefixes only pair with each other, so `CTL1` pairs with `DAT1` and
//! never with `D1`.

fn digits(rest: &str) -> bool {
    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
}

/// The name of the channel paired with `name`, if `name` follows the
/// control/data convention.
pub fn paired_name(name: &str) -> Option<String> {
    if let Some(rest) = name.strip_prefix("CTL") {
        return Some(format!("DAT{rest}"));
    }
    if let Some(rest) = name.strip_prefix("DAT") {
        return Some(format!("CTL{rest}"));
    }
    if let Some(rest) = name.strip_prefix('C').filter(|r| digits(r)) {
        return Some(format!("D{rest}"));
    }
    if let Some(rest) = name.strip_prefix('D').filter(|r| digits(r)) {
        return Some(format!("C{rest}"));
    }
    None
}

/// True if `a` and `b` are the two channels of one AP210 pair.
pub fn is_pair(a: &str, b: &str) -> bool {
    paired_name(a).is_some_and(|p| p == b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_prefixes_pair() {
        assert!(is_pair("CTL", "DAT"));
        assert!(is_pair("DAT", "CTL"));
        assert!(is_pair("CTL7", "DAT7"));
    }

    #[test]
    fn test_short_prefixes_pair() {
        assert!(is_pair("C123", "D123"));
        assert!(is_pair("D123", "C123"));
    }

    #[test]
    fn test_mixed_prefixes_do_not_pair() {
        assert!(!is_pair("CTL", "D123"));
        assert!(!is_pair("C123", "DAT123"));
        assert!(!is_pair("CTL123", "D123"));
        assert!(!is_pair("C123", "D124"));
    }

    #[test]
    fn test_unrelated_names() {
        assert_eq!(paired_name("FOO"), None);
        assert_eq!(paired_name("C"), None);
        assert_eq!(paired_name("D"), None);
        assert_eq!(paired_name("CAT"), None);
        assert!(!is_pair("FOO", "BAR"));
        // comparison is case-exact
        assert!(!is_pair("ctl1", "dat1"));
    }
}
