//! Text plumbing for the reply grammar: entity escaping and dedent

/// Unescape the XML entities the models actually emit.
pub fn unescape_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Escape text for embedding as tag content. `&` first so entities survive
/// a later unescape intact.
pub fn escape_entities(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Strip the common leading whitespace of all non-blank lines, then trim
/// surrounding blank lines.
pub fn dedent(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let margin = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut out: Vec<&str> = lines
        .iter()
        .map(|l| {
            if l.len() >= margin {
                &l[margin..]
            } else {
                l.trim_start()
            }
        })
        .collect();

    while out.first().is_some_and(|l| l.trim().is_empty()) {
        out.remove(0);
    }
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }

    out.join("\n")
}

/// Unescape then dedent - the treatment of `diff`, `data`, `command`,
/// `content`, `todo`, and `context` fields.
pub fn clean_field(text: &str) -> String {
    dedent(&unescape_entities(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_then_unescape_round_trips() {
        let original = "if a < b && b > c { \"quote\" }";
        assert_eq!(unescape_entities(&escape_entities(original)), original);
    }

    #[test]
    fn dedent_strips_common_margin() {
        let text = "\n    fn main() {\n        println!(\"hi\");\n    }\n";
        assert_eq!(dedent(text), "fn main() {\n    println!(\"hi\");\n}");
    }

    #[test]
    fn dedent_handles_single_line() {
        assert_eq!(dedent("  echo hi  "), "echo hi  ");
    }

    #[test]
    fn dedent_of_blank_text_is_empty() {
        assert_eq!(dedent("   \n  \n"), "");
    }
}
