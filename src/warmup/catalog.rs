//! Prompt catalog loading and expansion into warmup tasks.
//! Catalog file: `{version, sections: [{kind, lang, prompts[], countFrom?, countTo?}]}`.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{collapse_whitespace, normalize_text};

/// Interface phrases that are narrated live and never precomputed. Compared after
/// normalization.
pub const EXCLUDED_PHRASES: &[&str] = &[
    "tap to start",
    "loading",
    "settings",
    "back",
    "next",
    "skip",
];

/// Most numerals a single counting section may expand to.
pub const MAX_COUNT_SPAN: u32 = 1_000;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("counting range {from}..={to} in section {kind:?} exceeds {MAX_COUNT_SPAN} numerals")]
    RangeTooLarge { kind: String, from: u32, to: u32 },
}

/// One language-tagged group of prompts of a single kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSection {
    pub kind: String,
    pub lang: String,
    #[serde(default)]
    pub prompts: Vec<String>,
    /// Inclusive numeral range appended to `prompts` (counting drills).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_from: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_to: Option<u32>,
}

impl CatalogSection {
    pub fn new(kind: impl Into<String>, lang: impl Into<String>, prompts: &[&str]) -> Self {
        Self {
            kind: kind.into(),
            lang: lang.into(),
            prompts: prompts.iter().map(|p| p.to_string()).collect(),
            count_from: None,
            count_to: None,
        }
    }

    pub fn counting(kind: impl Into<String>, lang: impl Into<String>, from: u32, to: u32) -> Self {
        Self {
            kind: kind.into(),
            lang: lang.into(),
            prompts: Vec::new(),
            count_from: Some(from),
            count_to: Some(to),
        }
    }

    /// Prompts followed by the numeral range, if any. An oversized range is ignored.
    pub fn texts(&self) -> impl Iterator<Item = String> + '_ {
        self.prompts
            .iter()
            .cloned()
            .chain(self.numerals().into_iter().flatten().map(|n| n.to_string()))
    }

    fn numerals(&self) -> Option<RangeInclusive<u32>> {
        match (self.count_from, self.count_to) {
            (Some(from), Some(to)) if from <= to && to - from < MAX_COUNT_SPAN => Some(from..=to),
            _ => None,
        }
    }

    fn check_range(&self) -> Result<(), CatalogError> {
        match (self.count_from, self.count_to) {
            (Some(from), Some(to)) if from <= to && to - from >= MAX_COUNT_SPAN => {
                Err(CatalogError::RangeTooLarge {
                    kind: self.kind.clone(),
                    from,
                    to,
                })
            }
            _ => Ok(()),
        }
    }

    fn has_prompts(&self) -> bool {
        !self.prompts.is_empty() || self.numerals().is_some()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    version: u32,
    sections: Vec<CatalogSection>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptCatalog {
    version: u32,
    sections: Vec<CatalogSection>,
}

/// Which kinds to warm. Empty selects every kind in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptSelection {
    pub kinds: Vec<String>,
}

impl PromptSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    fn includes(&self, kind: &str) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|k| k.eq_ignore_ascii_case(kind))
    }
}

/// One prompt to synthesize. `lang` is the language the clip is cached under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupTask {
    pub text: String,
    pub kind: String,
    pub lang: String,
}

impl PromptCatalog {
    pub fn new(sections: Vec<CatalogSection>) -> Self {
        Self {
            version: 1,
            sections,
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(content)?;
        for section in &file.sections {
            section.check_range()?;
        }
        Ok(Self {
            version: file.version,
            sections: file.sections,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn sections(&self) -> &[CatalogSection] {
        &self.sections
    }

    /// Distinct kinds in order of first appearance.
    pub fn kinds(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.sections
            .iter()
            .map(|s| s.kind.as_str())
            .filter(|k| seen.insert(k.to_ascii_lowercase()))
            .collect()
    }

    /// Flatten the selected kinds into a deduplicated task list for `lang`. A kind with
    /// no prompts in `lang` falls back to `fallback` when one is given.
    pub fn expand(
        &self,
        selection: &PromptSelection,
        lang: &str,
        fallback: Option<&str>,
    ) -> Vec<WarmupTask> {
        let mut tasks = Vec::new();
        let mut seen = HashSet::new();

        for kind in self.kinds() {
            if !selection.includes(kind) {
                continue;
            }
            let mut task_lang = lang;
            let mut matched = self.sections_for(kind, lang);
            if matched.is_empty() {
                if let Some(fallback) = fallback {
                    task_lang = fallback;
                    matched = self.sections_for(kind, fallback);
                }
            }

            for section in matched {
                for raw in section.texts() {
                    let text = collapse_whitespace(&raw);
                    let normalized = normalize_text(&text);
                    if normalized.is_empty() || EXCLUDED_PHRASES.contains(&normalized.as_str()) {
                        continue;
                    }
                    if !seen.insert((normalized, task_lang.to_ascii_lowercase())) {
                        continue;
                    }
                    tasks.push(WarmupTask {
                        text,
                        kind: kind.to_string(),
                        lang: task_lang.to_string(),
                    });
                }
            }
        }
        tasks
    }

    fn sections_for(&self, kind: &str, lang: &str) -> Vec<&CatalogSection> {
        self.sections
            .iter()
            .filter(|s| s.kind.eq_ignore_ascii_case(kind) && lang_matches(&s.lang, lang))
            .filter(|s| s.has_prompts())
            .collect()
    }
}

/// Language tags match case-insensitively, or when their primary subtags agree
/// (`en` matches `en-US`).
pub fn lang_matches(tag: &str, wanted: &str) -> bool {
    let primary = |t: &str| t.split(['-', '_']).next().unwrap_or_default().to_ascii_lowercase();
    tag.eq_ignore_ascii_case(wanted) || (!tag.is_empty() && primary(tag) == primary(wanted))
}
