//! Ban detection: deciding whether a response or error means the proxy was blocked.

use http::StatusCode;

/// Pluggable ban predicate.
pub trait BanPolicy: Send + Sync {
    /// Whether a response with this status and body means the proxy is banned.
    ///
    /// The middleware does not consume the body before deciding, so `body_empty` is only
    /// true when the response declares `Content-Length: 0`. A chunked or unsized empty
    /// body arrives as `false`.
    fn response_is_ban(&self, status: StatusCode, body_empty: bool) -> bool;

    /// Whether a transport error means the proxy is banned.
    fn error_is_ban(&self, err: &reqwest::Error) -> bool;
}

/// Default rules: anything but 200, 301 and 302 is a ban, as is an empty 200.
/// Every transport error is a ban unless the request could not even be built.
///
/// An empty 200 is only recognized when its length is declared as zero; see
/// [`BanPolicy::response_is_ban`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBanPolicy;

impl DefaultBanPolicy {
    const NOT_BAN_STATUSES: [StatusCode; 3] =
        [StatusCode::OK, StatusCode::MOVED_PERMANENTLY, StatusCode::FOUND];
}

impl BanPolicy for DefaultBanPolicy {
    fn response_is_ban(&self, status: StatusCode, body_empty: bool) -> bool {
        !Self::NOT_BAN_STATUSES.contains(&status) || (status == StatusCode::OK && body_empty)
    }

    fn error_is_ban(&self, err: &reqwest::Error) -> bool {
        !err.is_builder()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_response_rules() {
        let policy = DefaultBanPolicy;
        assert!(!policy.response_is_ban(StatusCode::OK, false));
        assert!(policy.response_is_ban(StatusCode::OK, true));
        assert!(!policy.response_is_ban(StatusCode::MOVED_PERMANENTLY, true));
        assert!(!policy.response_is_ban(StatusCode::FOUND, false));
        assert!(policy.response_is_ban(StatusCode::FORBIDDEN, false));
        assert!(policy.response_is_ban(StatusCode::TOO_MANY_REQUESTS, false));
        assert!(policy.response_is_ban(StatusCode::NOT_FOUND, false));
        assert!(policy.response_is_ban(StatusCode::SERVICE_UNAVAILABLE, false));
    }

    #[test]
    fn test_builder_errors_are_not_bans() {
        let err = reqwest::Client::new().get("not a url").build().unwrap_err();
        assert!(err.is_builder());
        assert!(!DefaultBanPolicy.error_is_ban(&err));
    }
}
