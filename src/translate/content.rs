//! Content normalization.
//!
//! Collapses the content shapes of all three dialects (plain strings, Anthropic
//! block lists, Responses multimodal arrays) into [`CanonicalContent`]. Nothing
//! here fails: unrecognized shapes degrade to text.

use serde_json::{Map, Value};

use super::canonical::{CanonicalContent, ContentPart, ImageUrl};

const DEFAULT_IMAGE_MEDIA_TYPE: &str = "image/png";

pub fn normalize(content: &Value) -> CanonicalContent {
    match content {
        Value::Null => CanonicalContent::Text(String::new()),
        Value::String(text) => CanonicalContent::Text(text.clone()),
        Value::Array(items) => {
            let parts = items.iter().filter_map(normalize_item).collect();
            CanonicalContent::from_parts(parts)
        }
        other => CanonicalContent::Text(other.to_string()),
    }
}

fn normalize_item(item: &Value) -> Option<ContentPart> {
    let block = match item {
        Value::String(text) => return Some(ContentPart::text(text.clone())),
        Value::Object(block) => block,
        other => {
            tracing::debug!(item = %other, "Dropping non-object content item");
            return None;
        }
    };

    match block_type(block) {
        "text" | "input_text" | "output_text" => Some(ContentPart::text(str_field(block, "text"))),
        "image_url" => Some(ContentPart::ImageUrl {
            image_url: passthrough_image_url(block.get("image_url")),
        }),
        "input_image" => Some(ContentPart::image(input_image_url(block))),
        "image" => image_block_to_part(block),
        _ => match block.get("text").and_then(Value::as_str) {
            Some(text) => Some(ContentPart::text(text)),
            None => Some(ContentPart::text(item.to_string())),
        },
    }
}

/// Anthropic `image` block: base64 sources become data URLs, URL sources pass through.
pub fn image_block_to_part(block: &Map<String, Value>) -> Option<ContentPart> {
    let source = block.get("source").and_then(Value::as_object);
    let source_type = source
        .and_then(|s| s.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    if let Some(source) = source.filter(|_| source_type == "base64") {
        let media_type = source
            .get("media_type")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_IMAGE_MEDIA_TYPE);
        let data = source.get("data").and_then(Value::as_str).unwrap_or_default();
        return Some(ContentPart::image(format!("data:{media_type};base64,{data}")));
    }

    let url = source
        .filter(|_| source_type == "url")
        .and_then(|s| s.get("url"))
        .or_else(|| block.get("url"))
        .and_then(Value::as_str);

    match url {
        Some(url) => Some(ContentPart::image(url)),
        None => {
            tracing::debug!(source_type, "Dropping image block without usable source");
            None
        }
    }
}

fn passthrough_image_url(value: Option<&Value>) -> ImageUrl {
    match value {
        Some(Value::String(url)) => ImageUrl {
            url: url.clone(),
            detail: None,
        },
        Some(Value::Object(obj)) => ImageUrl {
            url: str_field(obj, "url"),
            detail: obj.get("detail").and_then(Value::as_str).map(String::from),
        },
        _ => ImageUrl {
            url: String::new(),
            detail: None,
        },
    }
}

fn input_image_url(block: &Map<String, Value>) -> String {
    let image_url = block.get("image_url");
    image_url
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            image_url
                .and_then(|v| v.get("url"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        })
        .or_else(|| block.get("url").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// Flatten tool-result content to one string: text items joined with `\n`,
/// falling back to the JSON text of the whole value.
pub fn flatten_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => joined_text(other).unwrap_or_else(|| other.to_string()),
    }
}

/// Anthropic `system` parameter as text. Unsupported shapes yield an empty string.
pub fn extract_system_text(system: Option<&Value>) -> String {
    match system {
        Some(Value::String(text)) => text.clone(),
        Some(other) => joined_text(other).unwrap_or_default(),
        None => String::new(),
    }
}

fn joined_text(value: &Value) -> Option<String> {
    let items = value.as_array()?;
    let parts: Vec<&str> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(text) => Some(text.as_str()),
            Value::Object(block) if block_type(block) == "text" => {
                block.get("text").and_then(Value::as_str)
            }
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

pub(crate) fn block_type(block: &Map<String, Value>) -> &str {
    block.get("type").and_then(Value::as_str).unwrap_or_default()
}

pub(crate) fn str_field(block: &Map<String, Value>, key: &str) -> String {
    block
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_and_string() {
        assert_eq!(normalize(&Value::Null), CanonicalContent::Text(String::new()));
        assert_eq!(normalize(&json!("hi")), CanonicalContent::Text("hi".into()));
    }

    #[test]
    fn test_single_text_part_collapses() {
        for text in ["", "x", "multi\nline"] {
            let content = normalize(&json!([{"type": "input_text", "text": text}]));
            assert_eq!(content, CanonicalContent::Text(text.to_string()));
        }
        assert_eq!(normalize(&json!(["bare"])), CanonicalContent::Text("bare".into()));
    }

    #[test]
    fn test_empty_and_bogus_lists() {
        assert_eq!(normalize(&json!([])), CanonicalContent::Parts(vec![]));

        // Unknown item without text is stringified, then collapsed.
        let content = normalize(&json!([{"type": "bogus"}]));
        assert_eq!(content, CanonicalContent::Text("{\"type\":\"bogus\"}".into()));

        let content = normalize(&json!([{"type": "refusal", "text": "no"}]));
        assert_eq!(content, CanonicalContent::Text("no".into()));
    }

    #[test]
    fn test_scalar_content_is_stringified() {
        assert_eq!(normalize(&json!(42)), CanonicalContent::Text("42".into()));
        assert_eq!(
            normalize(&json!({"a": 1})),
            CanonicalContent::Text("{\"a\":1}".into())
        );
    }

    #[test]
    fn test_input_image_url_chain() {
        let cases = [
            json!({"type": "input_image", "image_url": "https://a/1.png"}),
            json!({"type": "input_image", "image_url": {"url": "https://a/1.png"}}),
            json!({"type": "input_image", "url": "https://a/1.png"}),
        ];
        for case in cases {
            let content = normalize(&json!([case, {"type": "text", "text": "what"}]));
            assert_eq!(
                content,
                CanonicalContent::Parts(vec![
                    ContentPart::image("https://a/1.png"),
                    ContentPart::text("what"),
                ])
            );
        }
    }

    #[test]
    fn test_base64_image_becomes_data_url() {
        let content = normalize(&json!([
            {"type": "image", "source": {"type": "base64", "data": "AAAA"}},
            {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "BBBB"}}
        ]));
        assert_eq!(
            content,
            CanonicalContent::Parts(vec![
                ContentPart::image("data:image/png;base64,AAAA"),
                ContentPart::image("data:image/jpeg;base64,BBBB"),
            ])
        );
    }

    #[test]
    fn test_image_url_part_passes_through_with_detail() {
        let content = normalize(&json!([
            {"type": "image_url", "image_url": {"url": "https://x", "detail": "low"}},
            "caption"
        ]));
        let CanonicalContent::Parts(parts) = content else {
            panic!("expected parts");
        };
        assert_eq!(
            parts[0],
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://x".into(),
                    detail: Some("low".into())
                }
            }
        );
    }

    #[test]
    fn test_flatten_text() {
        assert_eq!(flatten_text(&Value::Null), "");
        assert_eq!(flatten_text(&json!("ok")), "ok");
        assert_eq!(
            flatten_text(&json!([{"type": "text", "text": "a"}, "b", {"type": "image"}])),
            "a\nb"
        );
        assert_eq!(flatten_text(&json!([{"type": "image"}])), "[{\"type\":\"image\"}]");
        assert_eq!(flatten_text(&json!({"k": true})), "{\"k\":true}");
    }

    #[test]
    fn test_extract_system_text() {
        assert_eq!(extract_system_text(None), "");
        assert_eq!(extract_system_text(Some(&json!("Be terse"))), "Be terse");
        assert_eq!(
            extract_system_text(Some(&json!([
                {"type": "text", "text": "one"},
                {"type": "text", "text": "two", "cache_control": {"type": "ephemeral"}}
            ]))),
            "one\ntwo"
        );
        assert_eq!(extract_system_text(Some(&json!(7))), "");
    }
}
