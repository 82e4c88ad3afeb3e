//! Multimodal content validation
//!
//! Image and video blocks are checked locally before any account is touched,
//! so a malformed payload never costs a request against a daily quota.

use serde_json::Value;

const IMAGE_DETAIL_LEVELS: &[&str] = &["low", "high", "auto"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Image URL is required for image content")]
    MissingImageUrl,

    #[error("Image URL must be a data URL or HTTP/HTTPS URL")]
    InvalidImageUrl,

    #[error("Image detail must be \"low\", \"high\", or \"auto\" (got {0})")]
    InvalidImageDetail(String),

    #[error("Video URL is required for video content")]
    MissingVideoUrl,

    #[error("Video URL must be a data URL or HTTP/HTTPS URL")]
    InvalidVideoUrl,
}

/// Validate every `image_url` and `video_url` block in `messages`.
///
/// Messages with plain string content are ignored.
pub fn validate_multimodal_content(messages: &[Value]) -> Result<(), ValidationError> {
    for message in messages {
        let Some(parts) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in parts {
            match part.get("type").and_then(Value::as_str) {
                Some("image_url") => validate_image(part.get("image_url"))?,
                Some("video_url") => validate_video(part.get("video_url"))?,
                _ => {}
            }
        }
    }
    Ok(())
}

fn validate_image(block: Option<&Value>) -> Result<(), ValidationError> {
    let url = block_url(block).ok_or(ValidationError::MissingImageUrl)?;
    if !is_supported_url(url) {
        return Err(ValidationError::InvalidImageUrl);
    }

    match block.and_then(|b| b.get("detail")) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(()),
        Some(Value::String(detail)) if detail.is_empty() => Ok(()),
        Some(Value::String(detail)) if IMAGE_DETAIL_LEVELS.contains(&detail.as_str()) => Ok(()),
        Some(Value::String(detail)) => Err(ValidationError::InvalidImageDetail(detail.clone())),
        Some(other) => Err(ValidationError::InvalidImageDetail(other.to_string())),
    }
}

fn validate_video(block: Option<&Value>) -> Result<(), ValidationError> {
    let url = block_url(block).ok_or(ValidationError::MissingVideoUrl)?;
    if !is_supported_url(url) {
        return Err(ValidationError::InvalidVideoUrl);
    }
    Ok(())
}

/// The url of a media block, accepting both `{"url": ...}` and a bare string.
fn block_url(block: Option<&Value>) -> Option<&str> {
    let url = match block? {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("url")?.as_str()?,
        _ => return None,
    };
    (!url.is_empty()).then_some(url)
}

fn is_supported_url(url: &str) -> bool {
    url.starts_with("data:") || url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_parts(parts: Value) -> Vec<Value> {
        vec![json!({"role": "user", "content": parts})]
    }

    #[test]
    fn plain_text_messages_pass() {
        let messages = vec![json!({"role": "user", "content": "hello"})];
        assert_eq!(validate_multimodal_content(&messages), Ok(()));
    }

    #[test]
    fn data_url_image_passes() {
        let messages = with_parts(json!([
            {"type": "text", "text": "what is this"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
        ]));
        assert_eq!(validate_multimodal_content(&messages), Ok(()));
    }

    #[test]
    fn https_image_with_low_detail_passes() {
        let messages = with_parts(json!([
            {"type": "image_url", "image_url": {"url": "https://example.com/cat.png", "detail": "low"}}
        ]));
        assert_eq!(validate_multimodal_content(&messages), Ok(()));
    }

    #[test]
    fn ftp_image_is_rejected() {
        let messages = with_parts(json!([
            {"type": "image_url", "image_url": {"url": "ftp://x"}}
        ]));
        assert_eq!(
            validate_multimodal_content(&messages),
            Err(ValidationError::InvalidImageUrl)
        );
    }

    #[test]
    fn falsy_detail_is_not_checked() {
        for detail in [json!(false), Value::Null, json!("")] {
            let messages = with_parts(json!([
                {"type": "image_url", "image_url": {"url": "https://example.com/a.png", "detail": detail}}
            ]));
            assert_eq!(validate_multimodal_content(&messages), Ok(()));
        }

        let messages = with_parts(json!([
            {"type": "image_url", "image_url": {"url": "https://example.com/a.png", "detail": true}}
        ]));
        assert!(validate_multimodal_content(&messages).is_err());
    }

    #[test]
    fn unknown_detail_is_rejected() {
        let messages = with_parts(json!([
            {"type": "image_url", "image_url": {"url": "https://example.com/a.png", "detail": "ultra"}}
        ]));
        assert_eq!(
            validate_multimodal_content(&messages),
            Err(ValidationError::InvalidImageDetail("ultra".into()))
        );
    }

    #[test]
    fn missing_image_url_is_rejected() {
        let messages = with_parts(json!([
            {"type": "image_url", "image_url": {"detail": "auto"}}
        ]));
        assert_eq!(
            validate_multimodal_content(&messages),
            Err(ValidationError::MissingImageUrl)
        );

        let messages = with_parts(json!([{"type": "image_url"}]));
        assert_eq!(
            validate_multimodal_content(&messages),
            Err(ValidationError::MissingImageUrl)
        );
    }

    #[test]
    fn video_blocks_check_url_only() {
        let ok = with_parts(json!([
            {"type": "video_url", "video_url": {"url": "http://example.com/clip.mp4", "detail": "ultra"}}
        ]));
        assert_eq!(validate_multimodal_content(&ok), Ok(()));

        let bad = with_parts(json!([
            {"type": "video_url", "video_url": {"url": "invalid-url-format"}}
        ]));
        assert_eq!(
            validate_multimodal_content(&bad),
            Err(ValidationError::InvalidVideoUrl)
        );

        let missing = with_parts(json!([{"type": "video_url", "video_url": {}}]));
        assert_eq!(
            validate_multimodal_content(&missing),
            Err(ValidationError::MissingVideoUrl)
        );
    }

    #[test]
    fn first_invalid_block_wins_across_messages() {
        let messages = vec![
            json!({"role": "system", "content": "be brief"}),
            json!({"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://ok.example/a.png"}}
            ]}),
            json!({"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "file:///etc/passwd"}}
            ]}),
        ];
        assert_eq!(
            validate_multimodal_content(&messages),
            Err(ValidationError::InvalidImageUrl)
        );
    }
}
