use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref AUTHORIZATION_REGEX: Regex = Regex::new(r"^(?i)bearer(?-i) (?P<rest>(.*))$").unwrap();
}

/// Extracts the JWT from a `Bearer` Authorization header.
pub fn parse_authorization_header(authorization: &str) -> Option<String> {
    let captures = AUTHORIZATION_REGEX.captures(authorization)?;
    Some(captures.name("rest").unwrap().as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_token() {
        assert_eq!(
            "some-token",
            parse_authorization_header("Bearer some-token").unwrap(),
        );
        assert_eq!(
            "some-token",
            parse_authorization_header("bearer some-token").unwrap(),
        );
    }

    #[test]
    fn test_rejects_non_bearer_scheme() {
        assert!(parse_authorization_header("Basic c29tZXVzZXI6cGFzcw==").is_none());
        assert!(parse_authorization_header("garbage").is_none());
    }
}
