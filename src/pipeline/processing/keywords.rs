//! Versioned keyword table and the flag extractor built on it.
//!
//! The table is always passed in by the caller; nothing in here holds a process-wide
//! dictionary, so two runs pinned to the same table version produce identical flags.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::domain::{KeywordFlag, KeywordFlags};
use crate::error::{PipelineError, Result};

/// The table shipped in `config/keywords.toml`.
const PINNED_TABLE: &str = include_str!("../../../config/keywords.toml");

#[derive(Debug, Deserialize)]
struct KeywordTableFile {
    version: String,
    #[serde(default)]
    flags: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    patterns: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    goa: Vec<String>,
}

/// Compiled keyword table.
#[derive(Debug, Clone)]
pub struct KeywordTable {
    version: String,
    matchers: Vec<(KeywordFlag, Regex)>,
    goa: Option<Regex>,
}

/// Build one case-insensitive alternation from literal terms and raw patterns.
fn compile(terms: &[String], patterns: &[String]) -> Result<Option<Regex>> {
    let mut alternatives: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| format!(r"\b{}\b", regex::escape(t)))
        .collect();
    alternatives.extend(
        patterns
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| format!("(?:{})", p)),
    );
    if alternatives.is_empty() {
        return Ok(None);
    }
    let re = Regex::new(&format!("(?i){}", alternatives.join("|")))?;
    Ok(Some(re))
}

impl KeywordTable {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: KeywordTableFile = toml::from_str(content)?;
        if file.version.trim().is_empty() {
            return Err(PipelineError::Config("keyword table needs a non-empty version".into()));
        }

        for name in file.flags.keys().chain(file.patterns.keys()) {
            if KeywordFlag::from_name(name).is_none() {
                return Err(PipelineError::Config(format!(
                    "keyword table {} names unknown flag '{}'",
                    file.version, name
                )));
            }
        }

        let mut matchers = Vec::new();
        for flag in KeywordFlag::ALL {
            let terms = file.flags.get(flag.name()).map(Vec::as_slice).unwrap_or(&[]);
            let patterns = file.patterns.get(flag.name()).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(re) = compile(terms, patterns)? {
                matchers.push((flag, re));
            }
        }

        Ok(Self {
            version: file.version.trim().to_string(),
            matchers,
            goa: compile(&file.goa, &[])?,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read keyword table '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// The table pinned in the repository.
    pub fn pinned() -> Result<Self> {
        Self::from_toml_str(PINNED_TABLE)
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Derives keyword flags from free text. Pure over (text, table).
#[derive(Debug, Clone)]
pub struct KeywordExtractor {
    table: KeywordTable,
}

impl KeywordExtractor {
    pub fn new(table: KeywordTable) -> Self {
        Self { table }
    }

    pub fn table_version(&self) -> &str {
        self.table.version()
    }

    pub fn extract(&self, text: &str) -> KeywordFlags {
        let mut flags = KeywordFlags::default();
        if text.is_empty() {
            return flags;
        }
        for (flag, re) in &self.table.matchers {
            if re.is_match(text) {
                flags.set(*flag, true);
            }
        }
        flags
    }

    /// Whether responder notes say nobody was found on arrival.
    pub fn responder_goa(&self, status_notes: Option<&str>) -> bool {
        match (&self.table.goa, status_notes) {
            (Some(re), Some(notes)) => re.is_match(notes),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> KeywordExtractor {
        KeywordExtractor::new(KeywordTable::pinned().unwrap())
    }

    #[test]
    fn pinned_table_loads() {
        let table = KeywordTable::pinned().unwrap();
        assert_eq!(table.version(), "sf311-keywords-2024.1");
    }

    #[test]
    fn matching_is_case_insensitive_and_word_bounded() {
        let ex = extractor();
        let flags = ex.extract("TENT on RAMP, Wheelchair visible");
        assert!(flags.tents_present);
        assert!(flags.on_ramp);
        assert!(flags.wheelchair);
        assert!(!flags.fire);

        // "content" contains "tent" but not on a word boundary
        assert!(!ex.extract("content of the report").tents_present);
        // "bat" must not fire inside "combat"
        assert!(!ex.extract("combat boots left").weapon);
    }

    #[test]
    fn patterns_extend_terms() {
        let ex = extractor();
        assert!(ex.extract("camp near the off-ramp").on_ramp);
        assert!(ex.extract("sleeping by the onramp").on_ramp);
    }

    #[test]
    fn empty_text_sets_nothing() {
        assert_eq!(extractor().extract(""), KeywordFlags::default());
    }

    #[test]
    fn goa_reads_status_notes() {
        let ex = extractor();
        assert!(ex.responder_goa(Some("Unable to locate client")));
        assert!(ex.responder_goa(Some("GOA")));
        assert!(!ex.responder_goa(Some("services offered")));
        assert!(!ex.responder_goa(None));
    }

    #[test]
    fn replacing_the_table_changes_the_flags() {
        let custom = KeywordTable::from_toml_str(
            r#"
            version = "test-1"
            [flags]
            fire = ["bonfire"]
            "#,
        )
        .unwrap();
        let ex = KeywordExtractor::new(custom);
        assert_eq!(ex.table_version(), "test-1");
        assert!(ex.extract("a bonfire at night").fire);
        assert!(!ex.extract("a fire at night").fire);
        assert!(!ex.extract("a tent").tents_present);
    }

    #[test]
    fn unknown_flag_names_are_rejected() {
        let err = KeywordTable::from_toml_str("version = \"x\"\n[flags]\ngraffiti = [\"tag\"]\n")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn bad_patterns_are_rejected() {
        let err = KeywordTable::from_toml_str("version = \"x\"\n[patterns]\nfire = [\"(\"]\n")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Pattern(_)));
    }
}
