//! Include/exclude rules for which relations produce events.

use stream_types::RelationName;

/// TimescaleDB-internal schemas whose changes are never streamed by default.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "_timescaledb_catalog.*",
    "_timescaledb_config.*",
    "_timescaledb_cache.*",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    schema: String,
    table: String,
}

impl Pattern {
    /// `schema.table`, where either part may use `*` and `?`. A bare table
    /// pattern matches in every schema.
    fn parse(pattern: &str) -> Self {
        match pattern.split_once('.') {
            Some((schema, table)) => Self {
                schema: schema.to_string(),
                table: table.to_string(),
            },
            None => Self {
                schema: "*".to_string(),
                table: pattern.to_string(),
            },
        }
    }

    fn matches(&self, name: &RelationName) -> bool {
        wildcard_match(&self.schema, &name.schema) && wildcard_match(&self.table, &name.table)
    }
}

/// Decides whether changes of a relation are streamed.
///
/// A relation passes when it matches any include pattern (or there are none)
/// and matches no exclude pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl RelationFilter {
    pub fn new<I, E, S, T>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            include: include.into_iter().map(|p| Pattern::parse(p.as_ref())).collect(),
            exclude: exclude.into_iter().map(|p| Pattern::parse(p.as_ref())).collect(),
        }
    }

    /// Everything except TimescaleDB's catalog schemas.
    pub fn timescaledb_defaults() -> Self {
        Self::new(Vec::<&str>::new(), DEFAULT_EXCLUDES.iter().copied())
    }

    pub fn accepts(&self, name: &RelationName) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|p| p.matches(name));
        included && !self.exclude.iter().any(|p| p.matches(name))
    }
}

/// Glob match supporting `*` (any run) and `?` (one character).
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
