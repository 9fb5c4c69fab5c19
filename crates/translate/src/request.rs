//! `OpenAI` chat-completions request → Anthropic Messages request.

use keygate_types::{GatewayError, RequestTranslator, Result};
use serde_json::{Map, Value, json};

/// `max_tokens` is mandatory upstream; used when the caller sets none.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Translator from the `OpenAI` request format to the Anthropic one.
///
/// System and developer messages are lifted into the top-level `system`
/// field. Assistant `tool_calls` become `tool_use` blocks and consecutive
/// `tool` messages are folded into one user turn of `tool_result` blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAIToClaude;

fn translation(msg: impl Into<String>) -> GatewayError {
    GatewayError::Translation(msg.into())
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// Flattens string-or-parts content into plain text.
fn plain_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| str_field(p, "text"))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn image_block(part: &Value) -> Result<Value> {
    let url = part
        .pointer("/image_url/url")
        .and_then(Value::as_str)
        .ok_or_else(|| translation("image_url part without url"))?;
    if let Some(rest) = url.strip_prefix("data:") {
        let (media_type, data) = rest
            .split_once(";base64,")
            .ok_or_else(|| translation("image data URL is not base64"))?;
        return Ok(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        }));
    }
    Ok(json!({"type": "image", "source": {"type": "url", "url": url}}))
}

/// Converts `OpenAI` message content into Anthropic content.
///
/// Plain strings stay strings; part arrays become content blocks.
fn content(content: Option<&Value>) -> Result<Value> {
    let parts = match content {
        None | Some(Value::Null) => return Ok(Value::String(String::new())),
        Some(Value::String(s)) => return Ok(Value::String(s.clone())),
        Some(Value::Array(parts)) => parts,
        Some(other) => return Err(translation(format!("unsupported content: {other}"))),
    };
    parts
        .iter()
        .map(|part| match str_field(part, "type") {
            Some("text") => Ok(json!({"type": "text", "text": str_field(part, "text").unwrap_or("")})),
            Some("image_url") => image_block(part),
            other => Err(translation(format!(
                "unsupported content part type {}",
                other.unwrap_or("<none>")
            ))),
        })
        .collect::<Result<Vec<_>>>()
        .map(Value::Array)
}

fn tool_use_block(call: &Value) -> Result<Value> {
    let id = str_field(call, "id").ok_or_else(|| translation("tool call without id"))?;
    let function = call
        .get("function")
        .ok_or_else(|| translation("tool call without function"))?;
    let name = str_field(function, "name").ok_or_else(|| translation("tool call without name"))?;
    let input = match str_field(function, "arguments").map(str::trim) {
        None | Some("") => json!({}),
        Some(args) => serde_json::from_str(args)
            .map_err(|e| translation(format!("tool call {id} has invalid arguments: {e}")))?,
    };
    Ok(json!({"type": "tool_use", "id": id, "name": name, "input": input}))
}

fn assistant_message(msg: &Value) -> Result<Value> {
    let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) else {
        return Ok(json!({"role": "assistant", "content": content(msg.get("content"))?}));
    };
    let mut blocks = Vec::with_capacity(calls.len() + 1);
    let text = plain_text(msg.get("content"));
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    for call in calls {
        blocks.push(tool_use_block(call)?);
    }
    Ok(json!({"role": "assistant", "content": blocks}))
}

fn tool_result_block(msg: &Value) -> Result<Value> {
    let id = str_field(msg, "tool_call_id")
        .ok_or_else(|| translation("tool message without tool_call_id"))?;
    Ok(json!({
        "type": "tool_result",
        "tool_use_id": id,
        "content": content(msg.get("content"))?,
    }))
}

fn tool_definition(tool: &Value) -> Result<Value> {
    if str_field(tool, "type").is_some_and(|t| t != "function") {
        return Err(translation(format!("unsupported tool type {}", tool["type"])));
    }
    let function = tool
        .get("function")
        .ok_or_else(|| translation("tool without function"))?;
    let name = str_field(function, "name").ok_or_else(|| translation("tool without name"))?;
    let mut out = json!({
        "name": name,
        "input_schema": function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    });
    if let Some(desc) = str_field(function, "description") {
        out["description"] = Value::String(desc.to_string());
    }
    Ok(out)
}

fn tool_choice(choice: &Value, parallel: Option<bool>) -> Option<Value> {
    let mut out = match choice {
        Value::String(s) => match s.as_str() {
            "auto" => json!({"type": "auto"}),
            "required" => json!({"type": "any"}),
            "none" => json!({"type": "none"}),
            _ => return None,
        },
        Value::Object(_) => {
            let name = choice.pointer("/function/name").and_then(Value::as_str)?;
            json!({"type": "tool", "name": name})
        }
        _ => return None,
    };
    if parallel == Some(false) && out["type"] != "none" {
        out["disable_parallel_tool_use"] = Value::Bool(true);
    }
    Some(out)
}

fn stop_sequences(stop: &Value) -> Option<Value> {
    match stop {
        Value::String(s) => Some(json!([s])),
        Value::Array(a) if !a.is_empty() => Some(Value::Array(a.clone())),
        _ => None,
    }
}

impl RequestTranslator for OpenAIToClaude {
    /// # Errors
    ///
    /// Returns [`GatewayError::Translation`] if `model` or `messages` is
    /// missing, or a message, tool call, or tool cannot be expressed in the
    /// Anthropic format.
    fn translate_request(&self, req: Value) -> Result<Value> {
        let model = str_field(&req, "model").ok_or_else(|| translation("missing 'model'"))?;
        let messages = req
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| translation("missing 'messages'"))?;

        let mut system = Vec::new();
        let mut turns: Vec<Value> = Vec::with_capacity(messages.len());
        let mut pending_results: Vec<Value> = Vec::new();

        for msg in messages {
            let role = str_field(msg, "role").unwrap_or("user");
            if role == "tool" {
                pending_results.push(tool_result_block(msg)?);
                continue;
            }
            if !pending_results.is_empty() {
                turns.push(json!({"role": "user", "content": std::mem::take(&mut pending_results)}));
            }
            match role {
                "system" | "developer" => {
                    let text = plain_text(msg.get("content"));
                    if !text.is_empty() {
                        system.push(text);
                    }
                }
                "assistant" => turns.push(assistant_message(msg)?),
                "user" => turns.push(json!({"role": "user", "content": content(msg.get("content"))?})),
                other => return Err(translation(format!("unsupported role {other}"))),
            }
        }
        if !pending_results.is_empty() {
            turns.push(json!({"role": "user", "content": pending_results}));
        }

        let mut out = Map::new();
        out.insert("model".into(), Value::String(model.to_string()));
        out.insert(
            "max_tokens".into(),
            req.get("max_completion_tokens")
                .or_else(|| req.get("max_tokens"))
                .and_then(Value::as_u64)
                .map_or(json!(DEFAULT_MAX_TOKENS), Value::from),
        );
        if !system.is_empty() {
            out.insert("system".into(), Value::String(system.join("\n\n")));
        }
        out.insert("messages".into(), Value::Array(turns));

        for key in ["temperature", "top_p", "stream"] {
            if let Some(v) = req.get(key).filter(|v| !v.is_null()) {
                out.insert(key.into(), v.clone());
            }
        }
        if let Some(stop) = req.get("stop").and_then(stop_sequences) {
            out.insert("stop_sequences".into(), stop);
        }
        if let Some(user) = str_field(&req, "user") {
            out.insert("metadata".into(), json!({"user_id": user}));
        }
        if let Some(tools) = req.get("tools").and_then(Value::as_array)
            && !tools.is_empty()
        {
            let tools = tools.iter().map(tool_definition).collect::<Result<Vec<_>>>()?;
            out.insert("tools".into(), Value::Array(tools));
        }
        let parallel = req.get("parallel_tool_calls").and_then(Value::as_bool);
        if let Some(choice) = req.get("tool_choice").and_then(|c| tool_choice(c, parallel)) {
            out.insert("tool_choice".into(), choice);
        }

        Ok(Value::Object(out))
    }
}
