//! Writes the worker's site list from a submitted form.
//!
//! The worker reads a JSON array of site entries, each with a start URL and
//! the CSS selectors for the list page and article page. Only the shape is
//! produced here; the worker owns the semantics.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Fields of the configuration form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SiteForm {
    pub name: String,
    pub url: String,
    pub title: String,
    pub link: String,
    pub content: String,
    pub next_page: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selectors {
    pub title: String,
    pub link: String,
    pub content: String,
    pub next_page: String,
}

/// One entry of the worker's site list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEntry {
    pub name: String,
    pub url: String,
    pub selectors: Selectors,
}

impl From<SiteForm> for SiteEntry {
    fn from(form: SiteForm) -> Self {
        Self {
            name: form.name,
            url: form.url,
            selectors: Selectors {
                title: form.title,
                link: form.link,
                content: form.content,
                next_page: form.next_page,
            },
        }
    }
}

/// Replace the site list at `path` with the single entry built from `form`,
/// returning that entry.
///
/// Output is pretty-printed JSON; non-ASCII text is written verbatim.
pub fn write_site_config(path: &Path, form: SiteForm) -> Result<SiteEntry> {
    let sites = [SiteEntry::from(form)];
    let json = serde_json::to_string_pretty(&sites).context("failed to serialize site config")?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    std::fs::write(path, json)
        .with_context(|| format!("failed to write site config at {}", path.display()))?;

    let [entry] = sites;
    tracing::info!(path = %path.display(), site = %entry.name, "wrote site config");
    Ok(entry)
}
