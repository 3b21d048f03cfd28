//! Connection request inspection and token authentication.

use std::collections::HashMap;

use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Header carrying the gateway token.
pub const TOKEN_HEADER: &str = "x-sisi-token";

/// Query parameter carrying the gateway token.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// What the gateway needs to know about an upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Request path, e.g. `/device`.
    pub path: String,
    /// Decoded query parameters. The first occurrence of a key wins.
    pub query: HashMap<String, String>,
    /// Request headers keyed by lower-case name.
    pub headers: HashMap<String, String>,
}

impl ConnectRequest {
    /// Build from a path with an optional `?query` suffix.
    #[must_use]
    pub fn from_path_and_query(path_and_query: &str) -> Self {
        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));
        Self {
            path: path.to_string(),
            query: parse_query(query),
            headers: HashMap::new(),
        }
    }

    /// Capture path, query and headers from a WebSocket upgrade request.
    #[must_use]
    pub fn from_http(request: &Request) -> Self {
        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Self {
            path: request.uri().path().to_string(),
            query: parse_query(request.uri().query().unwrap_or("")),
            headers,
        }
    }

    /// Add a header (name is lower-cased).
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Query parameter value.
    #[must_use]
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        out.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    out
}

/// Resolve the token a client presented.
///
/// Order: `token` query parameter, then the `x-sisi-token` header, then
/// `Authorization` (with a case-insensitive `Bearer ` prefix stripped).
/// Returns an empty string when none is present.
#[must_use]
pub fn resolve_token(request: &ConnectRequest) -> String {
    if let Some(token) = request
        .query_param(TOKEN_QUERY_PARAM)
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return token.to_string();
    }
    if let Some(token) = request
        .header(TOKEN_HEADER)
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return token.to_string();
    }
    let auth = request.header("authorization").map_or("", str::trim);
    match auth.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => auth[7..].trim().to_string(),
        _ => auth.to_string(),
    }
}

/// Outcome of a token check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// The gateway has no token configured.
    NotRequired,
    /// The presented token matched.
    Accepted,
    /// A token is required and none was presented.
    MissingToken,
    /// The presented token did not match.
    InvalidToken,
}

impl AuthDecision {
    /// Whether the connection may proceed.
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::NotRequired | Self::Accepted)
    }

    /// Reason string reported to clients and logs.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::NotRequired => "token_not_required",
            Self::Accepted => "ok",
            Self::MissingToken => "missing_token",
            Self::InvalidToken => "invalid_token",
        }
    }
}

/// Compare a presented token against the required one.
#[must_use]
pub fn check_token(required: &str, actual: &str) -> AuthDecision {
    let required = required.trim();
    let actual = actual.trim();
    if required.is_empty() {
        AuthDecision::NotRequired
    } else if actual.is_empty() {
        AuthDecision::MissingToken
    } else if actual != required {
        AuthDecision::InvalidToken
    } else {
        AuthDecision::Accepted
    }
}

/// Resolve and check the token of a request in one step.
#[must_use]
pub fn authorize(required: &str, request: &ConnectRequest) -> AuthDecision {
    check_token(required, &resolve_token(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // ==================== Request Tests ====================

    #[test]
    fn test_from_path_and_query() {
        let req = ConnectRequest::from_path_and_query("/device?device_id=d1&token=a%20b");
        assert_eq!(req.path, "/device");
        assert_eq!(req.query_param("device_id"), Some("d1"));
        assert_eq!(req.query_param("token"), Some("a b"));
    }

    #[test]
    fn test_first_query_value_wins() {
        let req = ConnectRequest::from_path_and_query("/x?a=1&a=2");
        assert_eq!(req.query_param("a"), Some("1"));
    }

    #[test]
    fn test_from_http_captures_headers() {
        let request = Request::builder()
            .uri("/control?session_id=s1")
            .header("X-Sisi-Token", "abc")
            .body(())
            .unwrap();
        let req = ConnectRequest::from_http(&request);

        assert_eq!(req.path, "/control");
        assert_eq!(req.query_param("session_id"), Some("s1"));
        assert_eq!(req.header("x-sisi-token"), Some("abc"));
    }

    // ==================== Token Resolution Tests ====================

    #[test]
    fn test_query_token_takes_precedence() {
        let req = ConnectRequest::from_path_and_query("/device?token=q")
            .with_header("x-sisi-token", "h")
            .with_header("authorization", "Bearer b");
        assert_eq!(resolve_token(&req), "q");
    }

    #[test]
    fn test_header_token_before_authorization() {
        let req = ConnectRequest::from_path_and_query("/device")
            .with_header("X-Sisi-Token", " h ")
            .with_header("authorization", "Bearer b");
        assert_eq!(resolve_token(&req), "h");
    }

    #[test_case("Bearer abc", "abc" ; "bearer prefix")]
    #[test_case("bearer   abc ", "abc" ; "lower case prefix")]
    #[test_case("BEARER abc", "abc" ; "upper case prefix")]
    #[test_case("  raw-token ", "raw-token" ; "raw value")]
    #[test_case("Bear", "Bear" ; "short value")]
    fn test_authorization_header(value: &str, expected: &str) {
        let req = ConnectRequest::from_path_and_query("/").with_header("Authorization", value);
        assert_eq!(resolve_token(&req), expected);
    }

    #[test]
    fn test_no_token_resolves_empty() {
        let req = ConnectRequest::from_path_and_query("/device?token=");
        assert_eq!(resolve_token(&req), "");
    }

    // ==================== Token Check Tests ====================

    #[test_case("", "", AuthDecision::NotRequired, "token_not_required" ; "not required")]
    #[test_case("", "anything", AuthDecision::NotRequired, "token_not_required" ; "not required with token")]
    #[test_case("secret", "", AuthDecision::MissingToken, "missing_token" ; "missing")]
    #[test_case("secret", "nope", AuthDecision::InvalidToken, "invalid_token" ; "invalid")]
    #[test_case("secret", " secret ", AuthDecision::Accepted, "ok" ; "accepted")]
    fn test_check_token(required: &str, actual: &str, decision: AuthDecision, reason: &str) {
        let got = check_token(required, actual);
        assert_eq!(got, decision);
        assert_eq!(got.reason(), reason);
    }

    #[test]
    fn test_is_allowed() {
        assert!(AuthDecision::NotRequired.is_allowed());
        assert!(AuthDecision::Accepted.is_allowed());
        assert!(!AuthDecision::MissingToken.is_allowed());
        assert!(!AuthDecision::InvalidToken.is_allowed());
    }

    #[test]
    fn test_authorize() {
        let req = ConnectRequest::from_path_and_query("/health?token=secret");
        assert_eq!(authorize("secret", &req), AuthDecision::Accepted);
        assert_eq!(authorize("other", &req), AuthDecision::InvalidToken);
    }
}
