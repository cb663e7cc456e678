//! Output filter policies.
//!
//! A worker prints much more than its progress events (framework banners,
//! middleware chatter, warnings). The capture task passes every raw line
//! through a [`LineFilter`] and forwards only accepted lines to clients.

/// Predicate deciding which raw output lines are forwarded to clients.
pub trait LineFilter: Send + Sync {
    /// Short policy name, used in logs.
    fn name(&self) -> &str;

    fn accepts(&self, line: &str) -> bool;
}

/// Default protocol tag: the bracketed spider name the worker's logger
/// stamps on its own progress lines.
pub const DEFAULT_TAG: &str = "[gov_policy]";

/// Accepts lines containing a fixed literal tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    tag: String,
}

impl TagFilter {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Default for TagFilter {
    fn default() -> Self {
        Self::new(DEFAULT_TAG)
    }
}

impl LineFilter for TagFilter {
    fn name(&self) -> &str {
        "tag"
    }

    fn accepts(&self, line: &str) -> bool {
        line.contains(self.tag.as_str())
    }
}

/// Forwards every line.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl LineFilter for AcceptAll {
    fn name(&self) -> &str {
        "accept-all"
    }

    fn accepts(&self, _line: &str) -> bool {
        true
    }
}
