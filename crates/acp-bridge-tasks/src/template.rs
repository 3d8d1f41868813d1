// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Prompt templating: `{{ <id>.result }}` placeholders are replaced with the
//! named sibling's result before a subtask's prompt is sent.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Replace every `{{ <id>.result }}` occurrence with the sibling's result.
/// A sibling that finished without a result (or an id that names no sibling)
/// renders as the empty string; text that does not match the placeholder
/// shape passes through untouched.
pub fn render(prompt: &str, results: &HashMap<String, Option<String>>) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)\.result\s*\}\}").unwrap());

    placeholder
        .replace_all(prompt, |caps: &regex::Captures<'_>| {
            results
                .get(&caps[1])
                .and_then(|result| result.clone())
                .unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(entries: &[(&str, Option<&str>)]) -> HashMap<String, Option<String>> {
        entries
            .iter()
            .map(|(id, value)| (id.to_string(), value.map(str::to_string)))
            .collect()
    }

    #[test]
    fn substitutes_results() {
        let rendered = render(
            "fix: {{scan.result}}",
            &results(&[("scan", Some("two bugs"))]),
        );
        assert_eq!(rendered, "fix: two bugs");
    }

    #[test]
    fn tolerates_whitespace_around_placeholder() {
        let rendered = render(
            "fix: {{  scan.result  }} and {{lint.result}}",
            &results(&[("scan", Some("A")), ("lint", Some("B"))]),
        );
        assert_eq!(rendered, "fix: A and B");
    }

    #[test]
    fn missing_result_renders_empty() {
        let rendered = render("got [{{scan.result}}]", &results(&[("scan", None)]));
        assert_eq!(rendered, "got []");
    }

    #[test]
    fn unknown_id_renders_empty() {
        let rendered = render("got [{{ghost.result}}]", &results(&[]));
        assert_eq!(rendered, "got []");
    }

    #[test]
    fn non_matching_patterns_pass_through() {
        let prompt = "keep {{scan.output}} and {{not valid.result}} and {result}";
        assert_eq!(render(prompt, &results(&[("scan", Some("X"))])), prompt);
    }

    #[test]
    fn repeated_placeholders_all_substitute() {
        let rendered = render(
            "{{a.result}}-{{a.result}}",
            &results(&[("a", Some("x"))]),
        );
        assert_eq!(rendered, "x-x");
    }
}
