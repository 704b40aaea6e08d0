use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Unix long-listing line: type flag, permission bits, then eight columns ending in the name
static LIST_LINE_REGEX: OnceLock<Regex> = OnceLock::new();

fn list_line_regex() -> &'static Regex {
    LIST_LINE_REGEX.get_or_init(|| {
        Regex::new(r"^([\-dlbcps])[rwxsStT\-]{9}\S*\s+\S+\s+\S+\s+\S+\s+\d+\s+\S+\s+\S+\s+\S+\s(.+)$")
            .expect("Failed to compile listing regex")
    })
}

/// How many matching files to take from one collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// First match in listing order, then stop
    First,
    /// Every match, in listing order
    #[default]
    All,
}

/// Kind of a listed entry, taken from the leading type flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Link,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub kind: EntryKind,
    pub name: String,
}

/// Parse one long-listing line. `total N` headers and unrecognised lines yield `None`.
pub fn parse_listing_line(line: &str) -> Option<ListingEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = list_line_regex().captures(line)?;
    let kind = match caps.get(1)?.as_str() {
        "-" => EntryKind::File,
        "d" => EntryKind::Directory,
        "l" => EntryKind::Link,
        _ => EntryKind::Other,
    };
    let raw_name = caps.get(2)?.as_str();
    let name = match kind {
        EntryKind::Link => raw_name.split(" -> ").next().unwrap_or(raw_name),
        _ => raw_name,
    };
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(ListingEntry {
        kind,
        name: name.to_string(),
    })
}

/// Picks the files to mirror out of a collection's detailed listing
#[derive(Debug, Clone)]
pub struct LeafSelector {
    marker: String,
    excluded_suffixes: Vec<String>,
    policy: SelectionPolicy,
}

impl LeafSelector {
    pub fn new(marker: &str, excluded_suffixes: &[String], policy: SelectionPolicy) -> Self {
        Self {
            marker: marker.to_lowercase(),
            excluded_suffixes: excluded_suffixes.iter().map(|s| s.to_lowercase()).collect(),
            policy,
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Whether a plain file name qualifies, ignoring entry type
    pub fn matches(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        lowered.contains(&self.marker)
            && !self
                .excluded_suffixes
                .iter()
                .any(|suffix| lowered.ends_with(suffix.as_str()))
    }

    /// File names to fetch, in listing order.
    ///
    /// Only regular files and links count; a directory named like a target is
    /// never selected.
    pub fn select<S: AsRef<str>>(&self, listing: &[S]) -> Vec<String> {
        let mut selected = Vec::new();
        for entry in listing.iter().filter_map(|line| parse_listing_line(line.as_ref())) {
            if !matches!(entry.kind, EntryKind::File | EntryKind::Link) {
                continue;
            }
            if !self.matches(&entry.name) {
                continue;
            }
            selected.push(entry.name);
            if self.policy == SelectionPolicy::First {
                break;
            }
        }
        selected
    }
}
