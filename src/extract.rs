//! Best-effort recovery of an HTML document from free-form model output.
//!
//! Strategies, tried in order until one matches:
//!
//! 1. a fenced block tagged `html`,
//! 2. any fenced block whose content looks like an HTML document,
//! 3. a `<!DOCTYPE html>` document through its first `</html>`,
//! 4. an `<html` opening tag through the last `</html>` in the text,
//! 5. the input, unchanged.
//!
//! Matching is ASCII case-insensitive. The strategies are re-applied to their
//! own output until nothing changes, which makes [`extract_artifact`]
//! idempotent.

use serde::{Deserialize, Serialize};

/// Result of [`extract_artifact`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub text: String,
    /// Whether extraction changed the text.
    pub extracted: bool,
}

/// Markers that identify HTML document content inside an untagged fence.
const DOCUMENT_MARKERS: [&str; 3] = ["<!doctype html", "<html", "<body"];

/// Extract the embedded HTML document from `text`.
///
/// # Examples
///
/// ```
/// use agent_pipeline::extract::extract_artifact;
///
/// let raw = "Sure! Here it is:\n```html\n<html><body>hi</body></html>\n```\nEnjoy.";
/// let out = extract_artifact(raw);
/// assert_eq!(out.text, "<html><body>hi</body></html>");
/// assert!(out.extracted);
///
/// let plain = extract_artifact("no markup here");
/// assert!(!plain.extracted);
/// ```
pub fn extract_artifact(text: &str) -> Extraction {
    let mut current = text;
    while let Some(next) = extract_once(current) {
        if next.len() >= current.len() {
            break;
        }
        current = next;
    }
    Extraction {
        extracted: current != text,
        text: current.to_string(),
    }
}

/// One pass over the strategies. `None` means nothing matched.
fn extract_once(text: &str) -> Option<&str> {
    let lower = text.to_ascii_lowercase();
    let blocks = code_blocks(text);

    let tagged = blocks
        .iter()
        .find(|b| matches!(b.lang.to_ascii_lowercase().as_str(), "html" | "htm"))
        .map(|b| b.content);
    if tagged.is_some() {
        return tagged;
    }

    let structural = blocks
        .iter()
        .find(|b| {
            let content = b.content.to_ascii_lowercase();
            DOCUMENT_MARKERS.iter().any(|m| content.contains(m))
        })
        .map(|b| b.content);
    if structural.is_some() {
        return structural;
    }

    if let Some(start) = lower.find("<!doctype html") {
        if let Some(end) = lower[start..].find("</html>") {
            return Some(&text[start..start + end + "</html>".len()]);
        }
    }

    if let Some(start) = lower.find("<html") {
        if let Some(end) = lower.rfind("</html>").filter(|&e| e > start) {
            return Some(&text[start..end + "</html>".len()]);
        }
    }

    None
}

struct CodeBlock<'a> {
    lang: &'a str,
    content: &'a str,
}

/// Every closed fenced block in `text`, in order. Content is trimmed.
fn code_blocks(text: &str) -> Vec<CodeBlock<'_>> {
    let mut blocks = Vec::new();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find("```") {
        let after_backticks = search_from + offset + 3;
        let Some(line_end) = text[after_backticks..].find('\n') else {
            break;
        };
        let lang = text[after_backticks..after_backticks + line_end].trim();
        let content_start = after_backticks + line_end + 1;

        let Some(close) = text[content_start..].find("```") else {
            break;
        };
        blocks.push(CodeBlock {
            lang,
            content: text[content_start..content_start + close].trim(),
        });
        search_from = content_start + close + 3;
    }
    blocks
}
