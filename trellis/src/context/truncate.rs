//! Bootstrap truncation pipeline.
//!
//! Context files are embedded into the system prompt under a global
//! character budget. Oversized files keep a head and a tail around a
//! marker; once the remaining budget drops under the minimum-file
//! threshold, later files are omitted entirely. The pipeline is idempotent:
//! running it twice on the same inputs equals running it once.

/// `[...truncated...]` marker inserted between head and tail.
pub const TRUNCATION_MARKER: &str = "\n[...truncated...]\n";

#[derive(Clone, Copy, Debug)]
pub struct TruncationConfig {
    /// Global budget across all files, in characters.
    pub global_budget: usize,
    /// Per-file cap, in characters.
    pub per_file_cap: usize,
    /// Budget floor: when the remainder drops below this, stop.
    pub min_file: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            global_budget: 24_000,
            per_file_cap: 20_000,
            min_file: 64,
        }
    }
}

/// One labeled context block after truncation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextBlock {
    pub name: String,
    pub content: String,
}

fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn char_suffix(s: &str, n: usize) -> &str {
    let len = s.chars().count();
    if n >= len {
        return s;
    }
    match s.char_indices().nth(len - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Truncates one file to the per-file cap: first 70% of the cap, marker,
/// last 20% of the cap. Files under the cap pass through unchanged.
fn truncate_file(content: &str, cap: usize) -> String {
    let len = content.chars().count();
    if len <= cap {
        return content.to_string();
    }
    let head = cap * 7 / 10;
    let tail = cap * 2 / 10;
    format!(
        "{}{}{}",
        char_prefix(content, head),
        TRUNCATION_MARKER,
        char_suffix(content, tail)
    )
}

/// Runs the full pipeline over ordered `(name, content)` files.
pub fn truncate_files(
    files: &[(String, String)],
    config: &TruncationConfig,
) -> Vec<ContextBlock> {
    let mut remaining = config.global_budget;
    let mut out = Vec::new();
    for (name, content) in files {
        if content.trim().is_empty() {
            continue;
        }
        if remaining < config.min_file {
            break;
        }
        let capped = truncate_file(content, config.per_file_cap);
        let emitted = if capped.chars().count() > remaining {
            char_prefix(&capped, remaining).to_string()
        } else {
            capped
        };
        remaining = remaining.saturating_sub(emitted.chars().count());
        out.push(ContextBlock {
            name: name.clone(),
            content: emitted,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(global: usize, cap: usize) -> TruncationConfig {
        TruncationConfig {
            global_budget: global,
            per_file_cap: cap,
            min_file: 64,
        }
    }

    #[test]
    fn small_files_pass_through() {
        let files = vec![("A".to_string(), "short".to_string())];
        let blocks = truncate_files(&files, &TruncationConfig::default());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "short");
    }

    #[test]
    fn empty_files_are_skipped() {
        let files = vec![
            ("A".to_string(), "  \n ".to_string()),
            ("B".to_string(), "kept".to_string()),
        ];
        let blocks = truncate_files(&files, &TruncationConfig::default());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name, "B");
    }

    #[test]
    fn oversized_file_keeps_head_marker_tail() {
        let content: String = (0..30_000).map(|i| ((i % 26) as u8 + b'a') as char).collect();
        let files = vec![("A".to_string(), content.clone())];
        let blocks = truncate_files(&files, &cfg(24_000, 20_000));
        let emitted = &blocks[0].content;
        assert!(emitted.chars().count() <= 20_000);
        assert!(emitted.contains("[...truncated...]"));
        assert!(emitted.starts_with(char_prefix(&content, 100)));
        assert!(emitted.ends_with(char_suffix(&content, 100)));
    }

    #[test]
    fn budget_exhaustion_omits_later_files() {
        // Ten 30k files, 24k global budget, 20k cap: the first file takes
        // ~18k, the second gets the residual, later files are omitted once
        // the budget drops under the floor.
        let files: Vec<(String, String)> = (0..10)
            .map(|i| (format!("F{}", i), "x".repeat(30_000)))
            .collect();
        let blocks = truncate_files(&files, &cfg(24_000, 20_000));
        assert!(blocks.len() < 10);
        let total: usize = blocks.iter().map(|b| b.content.chars().count()).sum();
        assert!(total <= 24_000);
        assert!(blocks[0].content.chars().count() <= 20_000);
    }

    #[test]
    fn pipeline_is_idempotent() {
        let files: Vec<(String, String)> = (0..4)
            .map(|i| (format!("F{}", i), "y".repeat(9_000)))
            .collect();
        let config = cfg(24_000, 8_000);
        let once = truncate_files(&files, &config);
        let twice_input: Vec<(String, String)> = once
            .iter()
            .map(|b| (b.name.clone(), b.content.clone()))
            .collect();
        let twice = truncate_files(&twice_input, &config);
        assert_eq!(once, twice);
    }
}
