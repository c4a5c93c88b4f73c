/// Origin/Security Policy
///
/// Decides whether the advertised `Origin` of an HTTP caller may use the
/// MCP endpoint. The rule order below is relied upon by deployed client
/// configurations and must not be reshuffled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginPolicy {
    /// `false` disables every check (local development opt-out).
    pub validate_origins: bool,
    /// Accept `http://localhost*` and `http://127.0.0.1*`.
    pub allow_localhost: bool,
    /// Exact, path-prefixed or trailing-`*` wildcard entries.
    pub allowed_origins: Vec<String>,
}

impl OriginPolicy {
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        if !self.validate_origins {
            return true;
        }

        let origin = origin.unwrap_or("");
        if origin.is_empty() && self.allowed_origins.is_empty() {
            return false;
        }

        // Checked before the allow-list so an incomplete list cannot lock out
        // local development.
        if self.allow_localhost
            && (origin.starts_with("http://localhost") || origin.starts_with("http://127.0.0.1"))
        {
            return true;
        }

        if !self.allowed_origins.is_empty() {
            return self
                .allowed_origins
                .iter()
                .any(|entry| matches_entry(origin, entry));
        }

        origin.starts_with("https://")
    }
}

fn matches_entry(origin: &str, entry: &str) -> bool {
    if let Some(prefix) = entry.strip_suffix('*') {
        return origin.starts_with(prefix);
    }
    if origin == entry {
        return true;
    }
    origin
        .strip_prefix(entry.trim_end_matches('/'))
        .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow_localhost: bool, list: &[&str]) -> OriginPolicy {
        OriginPolicy {
            validate_origins: true,
            allow_localhost,
            allowed_origins: list.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn disabled_validation_allows_everything() {
        let p = OriginPolicy {
            validate_origins: false,
            ..policy(false, &[])
        };
        assert!(p.is_allowed(Some("http://evil.com")));
        assert!(p.is_allowed(None));
    }

    #[test]
    fn localhost_allowed_and_plain_http_rejected() {
        let p = policy(true, &[]);
        assert!(p.is_allowed(Some("http://localhost:3000")));
        assert!(p.is_allowed(Some("http://127.0.0.1:8080")));
        assert!(!p.is_allowed(Some("http://evil.com")));
    }

    #[test]
    fn empty_origin_with_empty_list_is_rejected() {
        let p = policy(true, &[]);
        assert!(!p.is_allowed(None));
        assert!(!p.is_allowed(Some("")));
    }

    #[test]
    fn https_is_accepted_only_without_an_allow_list() {
        assert!(policy(false, &[]).is_allowed(Some("https://app.example.com")));
        assert!(!policy(false, &["https://other.example.com"]).is_allowed(Some("https://app.example.com")));
    }

    #[test]
    fn allow_list_supports_exact_path_prefix_and_wildcard() {
        let p = policy(false, &["https://a.example.com", "https://cdn.example.*"]);
        assert!(p.is_allowed(Some("https://a.example.com")));
        assert!(p.is_allowed(Some("https://a.example.com/app")));
        assert!(!p.is_allowed(Some("https://a.example.com.evil.net")));
        assert!(p.is_allowed(Some("https://cdn.example.org")));
        assert!(!p.is_allowed(Some("http://a.example.com")));
    }

    #[test]
    fn localhost_precedes_allow_list() {
        let p = policy(true, &["https://a.example.com"]);
        assert!(p.is_allowed(Some("http://localhost:5173")));
        assert!(!policy(false, &["https://a.example.com"]).is_allowed(Some("http://localhost:5173")));
    }
}
