use std::sync::OnceLock;

use regex::Regex;

const TAG_NAMES: [&str; 4] = ["think", "thinking", "reasoning", "reason"];

fn tag_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        TAG_NAMES
            .iter()
            .map(|tag| {
                Regex::new(&format!(
                    r"(?is)<\s*{tag}\s*>(.*?)<\s*/\s*{tag}\s*>"
                ))
                .expect("valid tag pattern")
            })
            .collect()
    })
}

fn opening_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        TAG_NAMES
            .iter()
            .map(|tag| Regex::new(&format!(r"(?i)^<\s*{tag}\s*>")).expect("valid opening pattern"))
            .collect()
    })
}

/// Splits reasoning framed in `<think>`-style tags out of model content.
/// Returns `(cleaned_content, extracted_reasoning)`; reasoning is empty when
/// no tags were found. Handles `<think>`, `<thinking>`, `<reasoning>` and
/// `<reason>` variants, case-insensitively, plus a closing-tag-only
/// fallback for responses whose opening tag was swallowed.
pub fn parse_think_tags(content: &str) -> (String, String) {
    if content.is_empty() {
        return (String::new(), String::new());
    }

    for pattern in tag_patterns() {
        if let Some(captures) = pattern.captures(content) {
            let reasoning = captures
                .get(1)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            let cleaned = pattern.replace_all(content, "").trim().to_string();
            return (cleaned, reasoning);
        }
    }

    // Closing tag only: everything before it is reasoning.
    let lower = content.to_lowercase();
    for tag in TAG_NAMES {
        let closing = format!("</{tag}>");
        if let Some(idx) = lower.find(&closing) {
            let mut reasoning = content[..idx].trim().to_string();
            let cleaned = content[idx + closing.len()..].trim().to_string();
            for opening in opening_patterns() {
                reasoning = opening.replace(&reasoning, "").trim().to_string();
            }
            if !reasoning.is_empty() && !cleaned.is_empty() {
                return (cleaned, reasoning);
            }
        }
    }

    (content.to_string(), String::new())
}

/// Prefer reasoning parsed from content tags over what the API reported
/// when the tag extraction is the richer trace.
pub fn merge_tag_reasoning(response: String, api_reasoning: String) -> (String, String) {
    let (cleaned, extracted) = parse_think_tags(&response);
    if extracted.is_empty() {
        return (response, api_reasoning);
    }
    if api_reasoning.is_empty() || extracted.len() > api_reasoning.len() {
        (cleaned, extracted)
    } else {
        (cleaned, api_reasoning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_think_tags() {
        let (content, reasoning) =
            parse_think_tags("<think>step by step</think>The answer is 4.");
        assert_eq!(content, "The answer is 4.");
        assert_eq!(reasoning, "step by step");
    }

    #[test]
    fn handles_tag_variants_and_case() {
        let (content, reasoning) =
            parse_think_tags("<REASONING>because</REASONING>Done.");
        assert_eq!(content, "Done.");
        assert_eq!(reasoning, "because");

        let (content, reasoning) = parse_think_tags("< thinking >hm</ thinking >ok");
        assert_eq!(content, "ok");
        assert_eq!(reasoning, "hm");
    }

    #[test]
    fn closing_tag_only_splits_reasoning_from_answer() {
        let (content, reasoning) =
            parse_think_tags("all the reasoning here</think>\n\nThe final answer.");
        assert_eq!(content, "The final answer.");
        assert_eq!(reasoning, "all the reasoning here");
    }

    #[test]
    fn untagged_content_passes_through() {
        let (content, reasoning) = parse_think_tags("Just an answer.");
        assert_eq!(content, "Just an answer.");
        assert!(reasoning.is_empty());
    }

    #[test]
    fn multiline_reasoning_is_captured() {
        let input = "<think>line one\nline two\n</think>\nAnswer";
        let (content, reasoning) = parse_think_tags(input);
        assert_eq!(content, "Answer");
        assert_eq!(reasoning, "line one\nline two");
    }

    #[test]
    fn merge_prefers_longer_tag_reasoning() {
        let (content, reasoning) = merge_tag_reasoning(
            "<think>very long detailed reasoning</think>Answer".to_string(),
            "short".to_string(),
        );
        assert_eq!(content, "Answer");
        assert_eq!(reasoning, "very long detailed reasoning");

        let (content, reasoning) = merge_tag_reasoning(
            "<think>x</think>Answer".to_string(),
            "a much longer api-provided trace".to_string(),
        );
        assert_eq!(content, "Answer");
        assert_eq!(reasoning, "a much longer api-provided trace");
    }

    #[test]
    fn merge_keeps_api_reasoning_when_no_tags() {
        let (content, reasoning) =
            merge_tag_reasoning("Plain answer".to_string(), "api trace".to_string());
        assert_eq!(content, "Plain answer");
        assert_eq!(reasoning, "api trace");
    }
}
