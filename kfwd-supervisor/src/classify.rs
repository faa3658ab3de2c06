//! kubectl does not expose structured errors, so failure classification is
//! a keyword scan over the combined error and stderr text. Auth failures get
//! long fleet-wide cooldowns, network failures short ones.

/// Broad category of a kubectl failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    Network,
    Other,
}

const AUTH_KEYWORDS: &[&str] = &[
    "unauthorized",
    "authentication",
    "token",
    "credential",
    "forbidden",
    "invalid user",
    "access denied",
    "unable to load aws credentials",
    "expired",
    "sso",
    "login",
    "auth",
    "permission denied",
    "invalid_grant",
    "session",
    "getting credentials",
    "refresh failed",
    "executable aws failed",
    "unable to connect to the server",
];

const NETWORK_KEYWORDS: &[&str] = &[
    "connection refused",
    "timeout",
    "network",
    "no route to host",
    "connection timed out",
    "dial tcp",
    "i/o timeout",
];

/// Classifies a failure by its text. Auth keywords win over network ones,
/// matching the cooldown escalation order.
pub fn classify(text: &str) -> FailureKind {
    if is_auth_error(text) {
        FailureKind::Auth
    } else if is_network_error(text) {
        FailureKind::Network
    } else {
        FailureKind::Other
    }
}

pub fn is_auth_error(text: &str) -> bool {
    let lowered = text.to_lowercase();
    AUTH_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

pub fn is_network_error(text: &str) -> bool {
    let lowered = text.to_lowercase();
    NETWORK_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_auth_errors() {
        let cases = [
            ("unauthorized", true),
            ("authentication failed", true),
            ("token expired", true),
            ("credential invalid", true),
            ("forbidden access", true),
            ("invalid user", true),
            ("access denied", true),
            ("Unable to load AWS credentials", true),
            ("error: invalid_grant response", true),
            ("connection refused", false),
            ("generic failure", false),
        ];
        for (text, expected) in cases {
            assert_eq!(is_auth_error(text), expected, "{text:?}");
        }
    }

    #[test]
    fn detects_network_errors() {
        let cases = [
            ("connection refused", true),
            ("timeout occurred", true),
            ("network unreachable", true),
            ("no route to host", true),
            ("connection timed out", true),
            ("dial tcp: connect failed", true),
            ("i/o timeout", true),
            ("unauthorized", false),
            ("generic failure", false),
        ];
        for (text, expected) in cases {
            assert_eq!(is_network_error(text), expected, "{text:?}");
        }
    }

    #[test]
    fn auth_wins_over_network_and_other_falls_through() {
        assert_eq!(classify("token refresh: connection refused"), FailureKind::Auth);
        assert_eq!(classify("dial tcp 10.0.0.1: i/o timeout"), FailureKind::Network);
        assert_eq!(classify("something else entirely"), FailureKind::Other);
    }
}
