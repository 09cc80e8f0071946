use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::ScoreConfig;
use crate::error::{PipelineError, Result};

/// Relevance scores keyed by file, optionally narrowed to one commit with a
/// `path@commit` key.
#[derive(Debug, Clone, Default)]
pub struct ScoreTable {
    by_file: HashMap<String, f64>,
    by_file_commit: HashMap<(String, String), f64>,
    match_basename: bool,
    pub malformed_lines: Vec<usize>,
}

impl ScoreTable {
    pub fn load(path: &Path, config: &ScoreConfig) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|err| PipelineError::input_format(path, format!("cannot read: {err}")))?;
        Ok(Self::parse(&content, config.match_basename))
    }

    pub fn parse(content: &str, match_basename: bool) -> Self {
        let mut table = Self {
            match_basename,
            ..Self::default()
        };

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_score_line(line) {
                Some((key, score)) => table.insert(key, score),
                None => table.malformed_lines.push(idx + 1),
            }
        }
        table
    }

    fn insert(&mut self, key: &str, score: f64) {
        let (file, commit) = match key.rsplit_once('@') {
            Some((file, commit)) if !file.is_empty() && !commit.is_empty() => (file, Some(commit)),
            _ => (key, None),
        };
        let file = self.normalize(file);
        let slot = match commit {
            Some(commit) => self
                .by_file_commit
                .entry((file, commit.to_string()))
                .or_insert(f64::NEG_INFINITY),
            None => self.by_file.entry(file).or_insert(f64::NEG_INFINITY),
        };
        // Repeated keys keep the strongest evidence.
        *slot = slot.max(score);
    }

    fn normalize(&self, file: &str) -> String {
        let file = file.trim().replace('\\', "/");
        if self.match_basename {
            match file.rsplit_once('/') {
                Some((_, name)) => name.to_string(),
                None => file,
            }
        } else {
            file.trim_start_matches("./").to_string()
        }
    }

    pub fn lookup(&self, file: &str, commit: &str) -> Option<f64> {
        let file = self.normalize(file);
        self.by_file_commit
            .get(&(file.clone(), commit.to_string()))
            .or_else(|| self.by_file.get(&file))
            .copied()
    }

    /// Absent files are not relevant; present ones must beat the threshold.
    pub fn is_relevant(&self, file: &str, commit: &str, threshold: f64) -> bool {
        self.lookup(file, commit)
            .is_some_and(|score| score > threshold)
    }

    pub fn len(&self) -> usize {
        self.by_file.len() + self.by_file_commit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_score_line(line: &str) -> Option<(&str, f64)> {
    let (key, raw_score) = if let Some((key, score)) = line.split_once("->") {
        (key.trim(), score.trim())
    } else {
        let (idx, sep) = line
            .char_indices()
            .rev()
            .find(|&(_, ch)| ch.is_whitespace() || ch == ',' || ch == ';')?;
        (
            line[..idx].trim_end_matches([',', ';']).trim(),
            line[idx + sep.len_utf8()..].trim(),
        )
    };
    if key.is_empty() {
        return None;
    }
    Some((key, parse_score(raw_score)?))
}

fn parse_score(raw: &str) -> Option<f64> {
    match raw.to_ascii_lowercase().as_str() {
        "" => None,
        "true" | "yes" => Some(1.0),
        "false" | "no" => Some(0.0),
        other => other.parse::<f64>().ok().filter(|value| value.is_finite()),
    }
}

#[cfg(test)]
mod tests {
    use super::ScoreTable;

    #[test]
    fn parses_arrow_whitespace_and_delimited_entries() {
        let table = ScoreTable::parse(
            "# produced by the fix miner\n\
             src/X.java -> 1\n\
             src/Y.java 0\n\
             src/Z.java,0.75\n\
             src/W.java;true\n",
            false,
        );
        assert_eq!(table.lookup("src/X.java", "c1"), Some(1.0));
        assert_eq!(table.lookup("src/Y.java", "c1"), Some(0.0));
        assert_eq!(table.lookup("src/Z.java", "c1"), Some(0.75));
        assert_eq!(table.lookup("src/W.java", "c1"), Some(1.0));
        assert!(table.malformed_lines.is_empty());
    }

    #[test]
    fn malformed_and_empty_scores_are_recorded_not_fatal() {
        let table = ScoreTable::parse("X -> 1\nY ->\nZ -> lots\njunk\n", false);
        assert_eq!(table.len(), 1);
        assert_eq!(table.malformed_lines, vec![2, 3, 4]);
        assert!(!table.is_relevant("Y", "c", 0.0));
    }

    #[test]
    fn multibyte_whitespace_separates_key_from_score() {
        let table = ScoreTable::parse("X.java\u{00A0}1\nY.java\u{3000}0\nZ.java -> 1\n", false);
        assert_eq!(table.lookup("X.java", "c"), Some(1.0));
        assert_eq!(table.lookup("Y.java", "c"), Some(0.0));
        assert_eq!(table.lookup("Z.java", "c"), Some(1.0));
        assert!(table.malformed_lines.is_empty());
    }

    #[test]
    fn zero_and_absent_files_are_not_relevant() {
        let table = ScoreTable::parse("X -> 1\nY -> 0\n", false);
        assert!(table.is_relevant("X", "c", 0.0));
        assert!(!table.is_relevant("Y", "c", 0.0));
        assert!(!table.is_relevant("Q", "c", 0.0));
        assert!(!table.is_relevant("X", "c", 1.0));
    }

    #[test]
    fn commit_qualified_entries_take_precedence() {
        let table = ScoreTable::parse("A.java -> 0\nA.java@abc -> 1\n", false);
        assert!(table.is_relevant("A.java", "abc", 0.0));
        assert!(!table.is_relevant("A.java", "def", 0.0));
    }

    #[test]
    fn repeated_keys_keep_the_highest_score() {
        let table = ScoreTable::parse("A -> 0\nA -> 0.4\nA -> 0.1\n", false);
        assert_eq!(table.lookup("A", "c"), Some(0.4));
    }

    #[test]
    fn basename_matching_ignores_directories() {
        let table = ScoreTable::parse("core/src/Parser.java -> 1\n", true);
        assert!(table.is_relevant("other/Parser.java", "c", 0.0));
        assert!(!table.is_relevant("other/Lexer.java", "c", 0.0));
    }
}
