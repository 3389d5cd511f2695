// Notification and reason templates
//
// Two placeholder styles live in the locale tables:
//   {{name}}  - mustache style; whitespace inside the braces is ignored and
//               unknown names render as an empty string
//   {name}    - single-brace token; unknown names are left untouched
//
// Values are inserted verbatim (no HTML or JSON escaping, the push payload is
// serialized by serde) and the output is never rescanned, so a value that
// itself contains `{{x}}` is not expanded.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{(.*?)\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .expect("placeholder pattern is valid")
    })
}

/// Variables for a single render
#[derive(Debug, Default, Clone)]
pub struct TemplateVars {
    values: HashMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl ToString) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Substitute both placeholder styles in one pass
pub fn render(template: &str, vars: &TemplateVars) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &Captures| {
            if let Some(key) = caps.get(1) {
                return vars.get(key.as_str().trim()).unwrap_or("").to_string();
            }
            let key = &caps[2];
            match vars.get(key) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
