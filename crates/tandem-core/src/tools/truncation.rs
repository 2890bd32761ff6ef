//! Output truncation for tool results fed back to the model

/// Result of a truncation pass.
pub struct TruncationResult {
    pub text: String,
    pub dropped_lines: usize,
    pub original_bytes: usize,
}

impl TruncationResult {
    /// Human-readable notice appended when anything was dropped.
    pub fn notice(&self) -> Option<String> {
        if self.dropped_lines == 0 && self.text.len() >= self.original_bytes {
            return None;
        }
        Some(format!(
            "\n[... output truncated: kept last {} bytes of {}, dropped {} line(s) ...]",
            self.text.len(),
            self.original_bytes,
            self.dropped_lines
        ))
    }
}

/// Keep the tail of `text` within `max_lines` and `max_bytes`, preserving
/// whole lines and UTF-8 boundaries. Recent output is what the model needs;
/// the head is what gets dropped.
pub fn truncate_tail(text: &str, max_lines: usize, max_bytes: usize) -> TruncationResult {
    let original_bytes = text.len();
    let lines: Vec<&str> = text.lines().collect();

    let mut kept: Vec<&str> = Vec::new();
    let mut bytes = 0usize;
    for line in lines.iter().rev() {
        let cost = line.len() + 1;
        if kept.len() >= max_lines || bytes + cost > max_bytes {
            break;
        }
        bytes += cost;
        kept.push(line);
    }
    kept.reverse();

    let dropped_lines = lines.len() - kept.len();
    TruncationResult {
        text: kept.join("\n"),
        dropped_lines,
        original_bytes,
    }
}

/// Apply truncation and fold the notice into the text.
pub fn bounded(text: &str, max_lines: usize, max_bytes: usize) -> String {
    let result = truncate_tail(text, max_lines, max_bytes);
    match result.notice() {
        Some(notice) => format!("{}{}", result.text, notice),
        None => result.text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_passes_through() {
        let result = truncate_tail("a\nb\nc", 10, 1000);
        assert_eq!(result.text, "a\nb\nc");
        assert!(result.notice().is_none());
    }

    #[test]
    fn line_cap_keeps_the_tail() {
        let result = truncate_tail("1\n2\n3\n4\n5", 2, 1000);
        assert_eq!(result.text, "4\n5");
        assert_eq!(result.dropped_lines, 3);
        assert!(result.notice().is_some());
    }

    #[test]
    fn byte_cap_keeps_whole_recent_lines() {
        let result = truncate_tail("aaaa\nbbbb\ncccc", 10, 10);
        assert_eq!(result.text, "bbbb\ncccc");
        assert_eq!(result.dropped_lines, 1);
    }
}
