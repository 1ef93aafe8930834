//! URL Allow-List (C8): gates which URLs the URL Requester variant is
//! permitted to download from.
//!
//! Grounded in `UrlAllowListWrapper.cpp`: `isUrlAllowed` is true if the
//! `allowAllUrls` escape hatch is set, else true iff the candidate starts
//! with one of the configured prefixes. `create()` warns (does not fail)
//! on an empty list, since an allow-list with no entries and no escape
//! hatch simply denies every URL request, which is a valid if surprising
//! configuration.

use std::sync::RwLock;

#[derive(Debug)]
pub struct UrlAllowList {
    entries: RwLock<Vec<String>>,
    allow_all: bool,
}

impl UrlAllowList {
    /// `allow_all` is a distinct constructor flag, not implied by an empty
    /// `entries` list: an empty list with `allow_all: false` denies every
    /// URL, while an empty list with `allow_all: true` is the debug-build
    /// escape hatch from the original.
    pub fn new(entries: Vec<String>, allow_all: bool) -> Self {
        if entries.is_empty() && !allow_all {
            tracing::warn!("url allow-list is empty; all url requests will be denied");
        }
        Self {
            entries: RwLock::new(entries),
            allow_all,
        }
    }

    pub fn is_allowed(&self, url: &str) -> bool {
        if self.allow_all {
            return true;
        }
        self.entries
            .read()
            .expect("allow-list lock poisoned")
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }

    pub fn set_entries(&self, entries: Vec<String>) {
        *self.entries.write().expect("allow-list lock poisoned") = entries;
    }

    pub fn add_entry(&self, entry: String) {
        self.entries
            .write()
            .expect("allow-list lock poisoned")
            .push(entry);
    }

    pub fn allow_all(&self) -> bool {
        self.allow_all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_prefix_match_is_allowed() {
        let list = UrlAllowList::new(vec!["https://cdn.example.com/".into()], false);
        assert!(list.is_allowed("https://cdn.example.com/artifact.bin"));
        assert!(!list.is_allowed("https://evil.example.com/artifact.bin"));
    }

    #[test]
    fn allow_all_bypasses_entries() {
        let list = UrlAllowList::new(vec![], true);
        assert!(list.is_allowed("https://anything.example.com/x"));
    }

    #[test]
    fn empty_list_without_allow_all_denies_everything() {
        let list = UrlAllowList::new(vec![], false);
        assert!(!list.is_allowed("https://cdn.example.com/x"));
    }

    #[test]
    fn set_entries_replaces_prior_list() {
        let list = UrlAllowList::new(vec!["https://old.example.com/".into()], false);
        list.set_entries(vec!["https://new.example.com/".into()]);
        assert!(!list.is_allowed("https://old.example.com/x"));
        assert!(list.is_allowed("https://new.example.com/x"));
    }
}
