//! Built-in model catalogue, served when the provider's `/models` endpoint
//! is unavailable or no account can authenticate.

use serde_json::{Value, json};

const CREATED: u64 = 1_754_686_206;

/// Text models every account can use.
const BASE_MODELS: &[&str] = &[
    "qwen3-coder-plus",
    "qwen3-coder-turbo",
    "qwen3-plus",
    "qwen3-turbo",
];

/// OpenAI-style `{"object":"list","data":[...]}` catalogue.
pub fn fallback_models() -> Value {
    let mut data: Vec<Value> = BASE_MODELS
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": CREATED,
                "owned_by": "qwen"
            })
        })
        .collect();

    data.push(json!({
        "id": "qwen3-coder-480b",
        "object": "model",
        "created": CREATED,
        "owned_by": "qwen",
        "context_length": 262144,
        "capabilities": ["text", "code", "tools"]
    }));
    for id in ["qwen-vl-plus", "qwen-vl-max"] {
        data.push(json!({
            "id": id,
            "object": "model",
            "created": CREATED,
            "owned_by": "qwen",
            "context_length": 32768,
            "capabilities": ["text", "image", "video"]
        }));
    }

    json!({ "object": "list", "data": data })
}
