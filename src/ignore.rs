//! Ignore rules loaded from a tree-local `.patchignore` file.
//!
//! One pattern per line. Blank lines and lines starting with `#` are skipped.
//! Supported forms:
//! - `build/`   directory suffix: the directory and everything below it
//! - `*.log`    glob, matched against the file name (no `/` in the pattern)
//! - `docs/*.md` glob, matched against the whole relative path
//! - `cache`    exact path, or a path prefix ending on a component boundary

use std::path::Path;

use glob::Pattern;

use crate::error::{IoResultExt, PatchError, Result};

pub const IGNORE_FILE_NAME: &str = ".patchignore";

#[derive(Debug, Clone)]
enum Rule {
    Directory(String),
    NameGlob(Pattern),
    PathGlob(Pattern),
    Prefix(String),
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    /// Load `.patchignore` from `root`. A missing file yields an empty rule set.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(IGNORE_FILE_NAME);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).at(&path),
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.trim_start_matches("./").trim_start_matches('/');

            let rule = if let Some(dir) = line.strip_suffix('/') {
                Rule::Directory(dir.to_string())
            } else if line.contains(['*', '?', '[']) {
                let pattern = Pattern::new(line).map_err(|e| {
                    PatchError::Validation(format!("Bad ignore pattern '{line}': {e}"))
                })?;
                if line.contains('/') {
                    Rule::PathGlob(pattern)
                } else {
                    Rule::NameGlob(pattern)
                }
            } else {
                Rule::Prefix(line.to_string())
            };
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether a forward-slash relative path is excluded. The ignore file is
    /// always excluded.
    pub fn is_ignored(&self, relative: &str, is_dir: bool) -> bool {
        if !is_dir && relative == IGNORE_FILE_NAME {
            return true;
        }
        let name = relative.rsplit('/').next().unwrap_or(relative);

        // Any directory component, which excludes the last one for files.
        let has_dir_component = |dir: &str| {
            relative.split('/').rev().skip(usize::from(!is_dir)).any(|c| c == dir)
        };

        self.rules.iter().any(|rule| match rule {
            Rule::Directory(dir) => {
                (is_dir && relative == dir)
                    || under(relative, dir)
                    || (!dir.contains('/') && has_dir_component(dir.as_str()))
            }
            Rule::NameGlob(pattern) => pattern.matches(name),
            Rule::PathGlob(pattern) => pattern.matches(relative),
            Rule::Prefix(prefix) => relative == prefix || under(relative, prefix),
        })
    }
}

fn under(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
