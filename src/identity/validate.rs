use once_cell::sync::Lazy;
use regex::Regex;

// Letters/digits plus `_`, `-`, `.`; commas and newlines are excluded which
// keeps the `username,hash` credential record unambiguous.
static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\p{L}\p{N}_.\-]{3,32}$").expect("username regex"));

pub const MIN_PASSWORD_LEN: usize = 8;

pub fn is_valid_username(username: &str) -> bool {
    let u = username.trim();
    !u.is_empty() && USERNAME_RE.is_match(u)
}

pub fn is_valid_password(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LEN && !password.contains('\n') && !password.contains('\r')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames() {
        assert!(is_valid_username("alice_01"));
        assert!(is_valid_username("  bob.k-9  "));
        assert!(is_valid_username("tên_đẹp"));
        assert!(!is_valid_username("ab"));
        assert!(!is_valid_username(&"a".repeat(33)));
        assert!(is_valid_username(&"a".repeat(32)));
        assert!(!is_valid_username("a,b,c"));
        assert!(!is_valid_username("abc\ndef"));
        assert!(!is_valid_username("with space"));
        assert!(!is_valid_username(""));
    }

    #[test]
    fn passwords() {
        assert!(is_valid_password("longpass1"));
        assert!(is_valid_password("12345678"));
        assert!(!is_valid_password("short"));
        assert!(!is_valid_password("longpass\n1"));
        assert!(!is_valid_password("longpass\r1"));
    }
}
