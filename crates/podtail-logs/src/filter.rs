use regex::{Regex, RegexBuilder};

/// Include/exclude patterns applied to message content
#[derive(Clone, Default)]
pub struct ContentFilter {
    /// Content must match one of these (empty = all)
    include: Vec<Regex>,

    /// Content matching any of these is dropped
    exclude: Vec<Regex>,

    /// Case sensitivity
    case_insensitive: bool,
}

impl ContentFilter {
    /// Create a new filter from pattern strings
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self, regex::Error> {
        Self::build(include, exclude, false)
    }

    /// Create a case-insensitive filter
    pub fn new_case_insensitive<S: AsRef<str>>(
        include: &[S],
        exclude: &[S],
    ) -> Result<Self, regex::Error> {
        Self::build(include, exclude, true)
    }

    fn build<S: AsRef<str>>(
        include: &[S],
        exclude: &[S],
        case_insensitive: bool,
    ) -> Result<Self, regex::Error> {
        let compile = |patterns: &[S]| {
            patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p.as_ref())
                        .case_insensitive(case_insensitive)
                        .build()
                })
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
            case_insensitive,
        })
    }

    /// Content matches an include pattern, or there are none
    pub fn is_include(&self, content: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(content))
    }

    /// Content matches an exclude pattern
    pub fn is_exclude(&self, content: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(content))
    }

    /// Whether a line with this content should be emitted
    pub fn accepts(&self, content: &str) -> bool {
        !self.is_exclude(content) && self.is_include(content)
    }
}

impl std::fmt::Debug for ContentFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentFilter")
            .field(
                "include",
                &self.include.iter().map(Regex::as_str).collect::<Vec<_>>(),
            )
            .field(
                "exclude",
                &self.exclude.iter().map(Regex::as_str).collect::<Vec<_>>(),
            )
            .field("case_insensitive", &self.case_insensitive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = ContentFilter::default();
        assert!(filter.accepts("anything"));
    }

    #[test]
    fn test_include_any() {
        let filter = ContentFilter::new(&["error", "panic"], &[]).unwrap();
        assert!(filter.accepts("an error occurred"));
        assert!(filter.accepts("panic: boom"));
        assert!(!filter.accepts("everything is fine"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = ContentFilter::new(&["error"], &["healthz"]).unwrap();
        assert!(filter.accepts("error in handler"));
        assert!(!filter.accepts("error on /healthz"));
        assert!(filter.is_exclude("GET /healthz"));
    }

    #[test]
    fn test_case_insensitive() {
        let filter = ContentFilter::new_case_insensitive(&["error"], &[]).unwrap();
        assert!(filter.accepts("ERROR: disk full"));

        let strict = ContentFilter::new(&["error"], &[]).unwrap();
        assert!(!strict.accepts("ERROR: disk full"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ContentFilter::new(&["("], &[]).is_err());
    }
}
