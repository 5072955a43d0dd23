//! Reasoning-block handling for text responses.

/// Split `<think>...</think>` (or `<thinking>...</thinking>`) reasoning out of a response.
///
/// Returns `(reasoning, cleaned_text)`. Only the first block is lifted out;
/// `cleaned_text` is trimmed. Text without a complete block is returned as-is.
pub fn extract_thinking(text: &str) -> (Option<String>, String) {
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        let Some(start) = text.find(open) else {
            continue;
        };
        let Some(end_offset) = text[start..].find(close) else {
            continue;
        };
        let end = start + end_offset;

        let reasoning = text[start + open.len()..end].trim();
        let cleaned = format!("{}{}", &text[..start], &text[end + close.len()..]);
        let reasoning = (!reasoning.is_empty()).then(|| reasoning.to_string());
        return (reasoning, cleaned.trim().to_string());
    }

    (None, text.to_string())
}
