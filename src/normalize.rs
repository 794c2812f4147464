use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// A provider or registry address reduced to comparable parts. Blank fields
/// stay empty strings; nothing in here ever fails on missing input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub street_line: String,
    pub secondary_line: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

impl Address {
    pub fn has_secondary(&self) -> bool {
        !self.secondary_line.trim().is_empty()
    }
}

/// Words kept fully upper-case by `smart_title_case`.
const KEEP_UPPER: [&str; 8] = ["N", "S", "E", "W", "NE", "NW", "SE", "SW"];

/// Built-in commonly-used form -> postal-standard form pairs. A CSV supplied
/// at runtime replaces this table entirely.
const BUILT_IN_SUFFIXES: &[(&str, &str)] = &[
    ("st", "Street"),
    ("str", "Street"),
    ("ave", "Avenue"),
    ("av", "Avenue"),
    ("blvd", "Boulevard"),
    ("blv", "Boulevard"),
    ("rd", "Road"),
    ("dr", "Drive"),
    ("ln", "Lane"),
    ("ct", "Court"),
    ("pl", "Place"),
    ("sq", "Square"),
    ("pkwy", "Parkway"),
    ("pky", "Parkway"),
    ("cir", "Circle"),
    ("hwy", "Highway"),
    ("ter", "Terrace"),
    ("trl", "Trail"),
    ("expy", "Expressway"),
    ("plz", "Plaza"),
    ("pt", "Point"),
    ("xing", "Crossing"),
];

static SECONDARY_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\b(?:suite|ste|apt|apartment|floor|fl|unit|room|rm|bldg|p\.?\s*o\.?\s*box)\b|#).*")
        .expect("secondary unit pattern is valid")
});

/// Bidirectional street-suffix abbreviation dictionary
/// (commonly-used form <-> postal-standard form), keyed lower-case.
#[derive(Debug, Clone)]
pub struct SuffixTable {
    common_to_postal: HashMap<String, String>,
    postal_to_common: HashMap<String, String>,
}

impl SuffixTable {
    pub fn built_in() -> Self {
        Self::from_pairs(
            BUILT_IN_SUFFIXES
                .iter()
                .map(|(common, postal)| (common.to_string(), postal.to_string())),
        )
    }

    /// Loads a two-column CSV (commonly used form, postal standard form).
    /// The header row is skipped; blank cells are ignored.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed opening suffix CSV {}", path.display()))?;
        let mut pairs = Vec::new();
        for record in reader.records() {
            let record = record
                .with_context(|| format!("Failed reading suffix CSV {}", path.display()))?;
            let common = record.get(0).unwrap_or("").trim();
            let postal = record.get(1).unwrap_or("").trim();
            if !common.is_empty() && !postal.is_empty() {
                pairs.push((common.to_string(), postal.to_string()));
            }
        }
        Ok(Self::from_pairs(pairs.into_iter()))
    }

    fn from_pairs(pairs: impl Iterator<Item = (String, String)>) -> Self {
        let mut common_to_postal = HashMap::new();
        let mut postal_to_common = HashMap::new();
        for (common, postal) in pairs {
            common_to_postal
                .entry(common.to_lowercase())
                .or_insert_with(|| smart_title_case(&postal));
            postal_to_common
                .entry(postal.to_lowercase())
                .or_insert_with(|| smart_title_case(&common));
        }
        Self {
            common_to_postal,
            postal_to_common,
        }
    }

    pub fn postal_form(&self, word: &str) -> Option<&str> {
        self.common_to_postal
            .get(&word.to_lowercase())
            .map(String::as_str)
    }

    pub fn common_form(&self, word: &str) -> Option<&str> {
        self.postal_to_common
            .get(&word.to_lowercase())
            .map(String::as_str)
    }

    /// Both-direction replacements for one word, commonly-used -> postal
    /// first. Empty when the word is not a known suffix.
    pub fn rewrites_for(&self, word: &str) -> Vec<String> {
        let mut rewrites = Vec::new();
        if let Some(postal) = self.postal_form(word) {
            rewrites.push(postal.to_string());
        }
        if let Some(common) = self.common_form(word) {
            rewrites.push(common.to_string());
        }
        rewrites
    }

    /// Replaces the final street token with its postal-standard form when
    /// recognized. Trailing punctuation on the token is dropped.
    pub fn standardize_final_suffix(&self, street: &str) -> String {
        let mut words: Vec<&str> = street.split_whitespace().collect();
        let replaced;
        match words.last() {
            Some(last) => {
                let bare = last.trim_end_matches(['.', ',']);
                match self.postal_form(bare) {
                    Some(postal) => replaced = postal,
                    None => return words.join(" "),
                }
            }
            None => return String::new(),
        }
        let last_index = words.len() - 1;
        words[last_index] = replaced;
        words.join(" ")
    }
}

/// Title-cases each word, keeping direction words and 2-letter upper-case
/// codes as-is. Hyphenated tokens are cased per segment.
pub fn smart_title_case(text: &str) -> String {
    fn fix_word(word: &str) -> String {
        let w = word.trim();
        if w.is_empty() {
            return String::new();
        }
        let upper = w.to_uppercase();
        let two_letter_code = w.len() == 2
            && w.chars().any(|c| c.is_ascii_uppercase())
            && !w.chars().any(|c| c.is_ascii_lowercase());
        if KEEP_UPPER.contains(&upper.as_str()) || two_letter_code {
            return upper;
        }
        let mut chars = w.chars();
        match chars.next() {
            Some(first) => {
                first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
            }
            None => String::new(),
        }
    }
    text.split_whitespace()
        .map(|token| {
            token
                .split('-')
                .map(fix_word)
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// 4-digit numeric zips get a leading zero; everything else passes through.
pub fn normalize_zip(zip: &str) -> String {
    let trimmed = zip.trim();
    if trimmed.len() == 4 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("0{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Roster zips may carry a ZIP+4 suffix; keep the part before the first
/// hyphen, then pad.
pub fn normalize_roster_zip(zip: &str) -> String {
    normalize_zip(zip.split('-').next().unwrap_or(""))
}

/// Splits a raw street string into (street line, secondary line):
/// the first comma's remainder and any suite/unit/PO-Box tail move to the
/// secondary line, the final street token is suffix-standardized, and both
/// lines are smart title-cased. Empty input yields empty output.
pub fn split_street(raw: &str, table: &SuffixTable) -> (String, String) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (String::new(), String::new());
    }
    let mut street = raw.to_string();
    let mut secondary = String::new();

    if let Some(idx) = street.find(',') {
        secondary = street[idx + 1..].trim().to_string();
        street = street[..idx].trim().to_string();
    }

    if let Some(m) = SECONDARY_UNIT_RE.find(&street) {
        let unit = street[m.start()..].trim().to_string();
        street = street[..m.start()].trim().to_string();
        secondary = if secondary.is_empty() {
            unit
        } else {
            format!("{secondary} {unit}")
        };
    }

    street = table.standardize_final_suffix(&street);
    (smart_title_case(&street), smart_title_case(&secondary))
}
