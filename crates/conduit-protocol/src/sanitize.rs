//! Recursive string sanitization for inbound payloads.
//!
//! Strips `<script>` blocks, `javascript:` URI schemes and inline event
//! handler attributes (`onclick=` and friends inside a tag) from every
//! string value. Object keys are left untouched.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").unwrap());

static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?script[^>]*>?").unwrap());

static JS_URI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").unwrap());

/// An `on*=` attribute inside a tag; group 1 is the tag text before it.
static EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)(<[^>]*?[\s"'/])on[a-z]+\s*="#).unwrap());

/// Sanitize one string. Returns `None` when nothing changed.
pub fn sanitize_str(input: &str) -> Option<String> {
    if !needs_scan(input) {
        return None;
    }
    let mut out = SCRIPT_BLOCK.replace_all(input, "").into_owned();
    // Loop until stable so nested fragments like `javajavascript:script:`
    // cannot reassemble after one pass.
    loop {
        let next = EVENT_HANDLER
            .replace_all(
                &JS_URI.replace_all(&SCRIPT_TAG.replace_all(&out, ""), ""),
                "${1}",
            )
            .into_owned();
        if next == out {
            break;
        }
        out = next;
    }
    (out != input).then_some(out)
}

fn needs_scan(input: &str) -> bool {
    let lower = input.to_ascii_lowercase();
    lower.contains("script") || lower.contains('=')
}

/// Sanitize every string inside `value` in place. Returns how many strings
/// were modified.
pub fn sanitize_value(value: &mut Value) -> usize {
    match value {
        Value::String(s) => match sanitize_str(s) {
            Some(clean) => {
                *s = clean;
                1
            }
            None => 0,
        },
        Value::Array(items) => items.iter_mut().map(sanitize_value).sum(),
        Value::Object(map) => map.values_mut().map(sanitize_value).sum(),
        Value::Null | Value::Bool(_) | Value::Number(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn strips_script_blocks() {
        let out = sanitize_str("hi <script>alert(1)</script> there").unwrap();
        assert_eq!(out, "hi  there");
    }

    #[test]
    fn strips_multiline_script_case_insensitive() {
        let out = sanitize_str("a<SCRIPT type=\"x\">\nevil()\n</Script >b").unwrap();
        assert_eq!(out, "ab");
    }

    #[test]
    fn strips_javascript_uri() {
        let out = sanitize_str("<a href=\"JavaScript:alert(1)\">x</a>").unwrap();
        assert!(!out.to_lowercase().contains("javascript:"));
    }

    #[test]
    fn strips_event_handlers() {
        let out = sanitize_str("<img src=x onerror=alert(1)>").unwrap();
        assert!(!out.contains("onerror="));
        assert!(out.contains("src=x"));
    }

    #[test]
    fn strips_every_handler_in_a_tag() {
        let out = sanitize_str("<svg/onload=a() onmouseover = b()>").unwrap();
        assert!(out.starts_with("<svg/a()"));
        assert!(!out.contains("onload"));
        assert!(!out.contains("onmouseover"));
        assert!(out.ends_with("b()>"));
    }

    #[test]
    fn handler_like_text_outside_tags_is_kept() {
        assert_eq!(sanitize_str("online=yes"), None);
        assert_eq!(sanitize_str("status online=yes, once = 3"), None);
        assert_eq!(sanitize_str("config: {\"onboarding\": \"done\"}, retries=2"), None);
    }

    #[test]
    fn nested_fragments_do_not_reassemble() {
        let out = sanitize_str("javajavascript:script:alert(1)").unwrap();
        assert!(!out.to_lowercase().contains("javascript:"));
    }

    #[test]
    fn clean_strings_are_untouched() {
        assert_eq!(sanitize_str("plain text, a=b"), None);
        assert_eq!(sanitize_str("description of a manuscript"), None);
    }

    #[test]
    fn sanitizes_nested_values() {
        let mut value = json!({
            "title": "ok",
            "items": ["<script>x</script>safe", {"deep": "javascript:void(0)"}],
            "count": 3
        });
        let changed = sanitize_value(&mut value);
        assert_eq!(changed, 2);
        assert_eq!(value["items"][0], "safe");
        assert_eq!(value["items"][1]["deep"], "void(0)");
        assert_eq!(value["count"], 3);
        assert_eq!(value["title"], "ok");
    }

    proptest! {
        #[test]
        fn output_never_contains_script_tag(s in ".{0,64}") {
            let input = format!("{s}<script>{s}</script>{s}");
            let out = sanitize_str(&input).unwrap_or(input);
            prop_assert!(!out.to_lowercase().contains("<script"));
        }
    }
}
