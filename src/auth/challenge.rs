/// A parsed `Www-Authenticate` challenge from an upstream 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// `Bearer realm="…",service="…",scope="…"` — the registry token dance.
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    /// Plain `Basic` challenge; answered from stored mirror credentials.
    Basic,
}

impl Challenge {
    /// Parse a `Www-Authenticate` header value.
    ///
    /// Example: `Bearer realm="https://auth.docker.io/token",
    /// service="registry.docker.io",scope="repository:library/nginx:pull"`.
    /// Returns `None` for unknown schemes or a Bearer challenge without a
    /// realm (nothing to fetch a token from).
    pub fn parse(header: &str) -> Option<Self> {
        let trimmed = header.trim();
        if trimmed
            .get(..5)
            .is_some_and(|s| s.eq_ignore_ascii_case("basic"))
        {
            return Some(Challenge::Basic);
        }
        let Some(rest) = trimmed
            .get(..6)
            .filter(|s| s.eq_ignore_ascii_case("bearer"))
            .and_then(|_| trimmed.get(6..))
        else {
            return None;
        };

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for part in rest.split(',') {
            let part = part.trim();
            if let Some(value) = strip_param(part, "realm") {
                realm = Some(value);
            } else if let Some(value) = strip_param(part, "service") {
                service = Some(value);
            } else if let Some(value) = strip_param(part, "scope") {
                scope = Some(value);
            }
        }

        realm.map(|realm| Challenge::Bearer {
            realm,
            service,
            scope,
        })
    }
}

fn strip_param(part: &str, key: &str) -> Option<String> {
    let rest = part.strip_prefix(key)?.strip_prefix('=')?;
    let value = rest
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(rest);
    Some(value.to_string())
}
