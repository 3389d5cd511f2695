use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Embedded locale tables, keyed by language code
const EMBEDDED: &[(&str, &str)] = &[
    ("es", include_str!("../../locales/es.json")),
    ("en", include_str!("../../locales/en.json")),
    ("de", include_str!("../../locales/de.json")),
    ("fr", include_str!("../../locales/fr.json")),
    ("it", include_str!("../../locales/it.json")),
];

#[derive(Debug, Clone, Deserialize)]
pub struct LocaleStrings {
    pub challenge_card: ChallengeCardStrings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeCardStrings {
    /// Fine reason; `{title}` is the challenge title
    pub challenge_not_completed: String,
    /// Push title
    pub new_fine_received: String,
    /// Push body; `{{sender}}`, `{{amount}}`, `{{reason}}`
    pub fine_received_body: String,
}

pub struct LocaleCatalog {
    tables: HashMap<String, LocaleStrings>,
    fallback: String,
}

impl LocaleCatalog {
    /// Parse the tables compiled into the binary
    pub fn embedded(fallback: &str) -> AppResult<Self> {
        let mut tables = HashMap::new();
        for (code, raw) in EMBEDDED {
            let table: LocaleStrings = serde_json::from_str(raw)
                .map_err(|e| AppError::Locale(format!("{}: {}", code, e)))?;
            tables.insert(code.to_string(), table);
        }
        Self::from_tables(tables, fallback)
    }

    pub fn from_tables(tables: HashMap<String, LocaleStrings>, fallback: &str) -> AppResult<Self> {
        if !tables.contains_key(fallback) {
            return Err(AppError::Locale(format!(
                "fallback language '{}' has no table",
                fallback
            )));
        }

        Ok(Self {
            tables,
            fallback: fallback.to_string(),
        })
    }

    /// Table for `language`; empty or unknown codes use the fallback, and a
    /// regional code such as `en-GB` falls back to its primary subtag first.
    pub fn lookup(&self, language: Option<&str>) -> &LocaleStrings {
        let requested = language.map(str::trim).filter(|l| !l.is_empty());

        if let Some(code) = requested {
            let code = code.to_ascii_lowercase();
            if let Some(table) = self.tables.get(&code) {
                return table;
            }
            if let Some(primary) = code.split(['-', '_']).next() {
                if let Some(table) = self.tables.get(primary) {
                    return table;
                }
            }
            debug!("No locale table for '{}', using {}", code, self.fallback);
        }

        &self.tables[&self.fallback]
    }

    pub fn languages(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }
}
