use regex::{Regex, RegexBuilder};

/// Glob-style URL allow-list. `*` matches any character sequence, everything
/// else is literal; patterns are anchored and case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    patterns: Option<Vec<Regex>>,
}

impl AllowList {
    pub fn allow_all() -> Self {
        Self { patterns: None }
    }

    /// An empty pattern list allows everything, like an absent one.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let compiled = patterns
            .iter()
            .map(|pattern| pattern.as_ref().trim())
            .filter(|pattern| !pattern.is_empty())
            .map(compile_glob)
            .collect::<Result<Vec<_>, _>>()?;
        if compiled.is_empty() {
            return Ok(Self::allow_all());
        }
        Ok(Self {
            patterns: Some(compiled),
        })
    }

    pub fn is_restricted(&self) -> bool {
        self.patterns.is_some()
    }

    pub fn is_allowed(&self, url: &str) -> bool {
        match &self.patterns {
            None => true,
            Some(patterns) => patterns.iter().any(|pattern| pattern.is_match(url)),
        }
    }
}

fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{body}$"))
        .case_insensitive(true)
        .build()
}
