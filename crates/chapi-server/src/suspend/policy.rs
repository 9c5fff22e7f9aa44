//! Which application requests get suspended.

/// Outcome of the suspend decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Suspend,
    Resume,
}

/// Suspends GET and POST requests under any configured path prefix.
#[derive(Debug, Clone)]
pub struct SuspendPolicy {
    prefixes: Vec<String>,
}

impl SuspendPolicy {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn decide(&self, method: &str, path: &str) -> Action {
        let method_ok = matches!(method, "GET" | "POST");
        if method_ok && self.prefixes.iter().any(|p| matches_prefix(p, path)) {
            Action::Suspend
        } else {
            Action::Resume
        }
    }
}

/// Segment-aware prefix match: `/app` matches `/app` and `/app/feed`, not `/apple`.
fn matches_prefix(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
