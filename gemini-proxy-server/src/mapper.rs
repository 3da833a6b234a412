//! Translation between the Ollama wire shapes and Gemini's.

use crate::error::ProxyError;
use crate::gemini::types::{
    BackendRequest, Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
    ModelInfo, Part,
};
use crate::patch::PatchContext;
use chrono::{SecondsFormat, Utc};
use gemini_proxy_shared::{
    ChatCompletion, ChatMessage, ChatRequest, CompletionChoice, CompletionUsage, MessageRole,
    ModelCard, ModelDetails, ModelList, ResponseMessage, StreamChunk,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub const DEFAULT_TEMPERATURE: f32 = 0.5;
pub const DEFAULT_TOP_P: f32 = 1.0;

/// Size reported for every model; the backend does not expose one.
const PLACEHOLDER_MODEL_SIZE: u64 = 16_106_127_360;

pub fn to_backend_request(
    request: &ChatRequest,
    patch: &PatchContext,
) -> Result<BackendRequest, ProxyError> {
    if request.messages.is_empty() {
        return Err(ProxyError::InvalidRequest(
            "messages must contain at least one message".to_string(),
        ));
    }

    let (mut system, turns) = split_system(&request.messages);
    let mut contents: Vec<Content> = turns.into_iter().map(to_content).collect();

    // Gemini refuses a request without any conversational turn.
    if contents.is_empty() {
        if let Some(text) = system.take() {
            contents.push(Content::text(Some("user"), text));
        }
    }

    debug!(
        model = %request.model,
        turns = contents.len(),
        has_system = system.is_some(),
        is_patch = patch.is_patch,
        "Translated chat request"
    );

    Ok(BackendRequest {
        model: request.model.clone(),
        body: GenerateContentRequest {
            contents,
            system_instruction: system.map(|text| Content::text(None, text)),
            generation_config: generation_config(request),
        },
    })
}

/// Heuristic for IDE clients (JetBrains) that send their system prompt as
/// the first user message.
pub fn looks_like_system_prompt(message: &ChatMessage) -> bool {
    message.role == MessageRole::User && message.text().to_lowercase().contains("you must")
}

/// Separates the system instruction from the conversational turns.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let system: Vec<String> = messages
        .iter()
        .filter(|msg| msg.role == MessageRole::System)
        .map(ChatMessage::text)
        .collect();

    if !system.is_empty() {
        let turns = messages.iter().filter(|msg| msg.role != MessageRole::System).collect();
        return (Some(system.join("\n\n")), turns);
    }

    match messages.split_first() {
        Some((first, rest)) if !rest.is_empty() && looks_like_system_prompt(first) => {
            info!("Promoting first user message to system instruction");
            (Some(first.text()), rest.iter().collect())
        }
        _ => (None, messages.iter().collect()),
    }
}

fn gemini_role(role: MessageRole) -> &'static str {
    match role {
        MessageRole::Assistant => "model",
        MessageRole::User | MessageRole::System => "user",
        MessageRole::Other => {
            warn!("Coercing unknown message role to 'user'");
            "user"
        }
    }
}

fn to_content(message: &ChatMessage) -> Content {
    let text = message.text();
    let mut parts = Vec::with_capacity(1 + message.images.len());
    if !text.is_empty() || message.images.is_empty() {
        parts.push(Part::text(text));
    }
    parts.extend(message.images.iter().map(|image| image_part(image)));

    Content {
        role: Some(gemini_role(message.role).to_string()),
        parts,
    }
}

fn image_part(image: &str) -> Part {
    if let Some((header, data)) = image
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        return Part::inline(header, data);
    }
    Part::inline(sniff_image_mime(image), image)
}

fn sniff_image_mime(base64: &str) -> &'static str {
    if base64.starts_with("/9j/") {
        "image/jpeg"
    } else if base64.starts_with("R0lGOD") {
        "image/gif"
    } else if base64.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/png"
    }
}

/// Resolves generation options: `options` first, then top-level fields,
/// then the proxy defaults (never the backend's).
fn generation_config(request: &ChatRequest) -> GenerationConfig {
    let options = request.options.clone().unwrap_or_default();

    let seed = options.seed.or(request.seed).map(|seed| {
        i32::try_from(seed).unwrap_or_else(|_| {
            warn!(seed, "Seed out of 32-bit range, clamping");
            seed.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
        })
    });

    GenerationConfig {
        temperature: options.temperature.or(request.temperature).unwrap_or(DEFAULT_TEMPERATURE),
        top_p: options.top_p.or(request.top_p).unwrap_or(DEFAULT_TOP_P),
        top_k: options.top_k,
        seed,
        stop_sequences: options.stop.or_else(|| request.stop.clone()).unwrap_or_default(),
        max_output_tokens: options
            .num_predict
            .filter(|limit| *limit > 0)
            .map(|limit| u32::try_from(limit).unwrap_or(u32::MAX)),
    }
}

pub fn created_at() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One non-terminal ndjson record for a backend chunk.
pub fn from_backend_chunk(chunk: &GenerateContentResponse, model: &str) -> StreamChunk {
    StreamChunk::delta(model, created_at(), chunk.text())
}

/// Maps a Gemini finish reason onto Ollama's `done_reason`.
pub fn done_reason(finish_reason: Option<&str>) -> String {
    match finish_reason {
        None | Some("STOP") => "stop".to_string(),
        Some("MAX_TOKENS") => "length".to_string(),
        Some(other) => other.to_lowercase(),
    }
}

pub fn to_model_list(models: Vec<ModelInfo>) -> ModelList {
    let modified_at = created_at();
    let models = models
        .into_iter()
        .filter(|model| {
            model
                .supported_generation_methods
                .iter()
                .any(|method| method == "generateContent")
        })
        .map(|model| {
            let name = model
                .name
                .strip_prefix("models/")
                .unwrap_or(&model.name)
                .to_string();
            let display_name = if model.display_name.is_empty() {
                name.clone()
            } else {
                model.display_name
            };

            ModelCard {
                model: name.clone(),
                digest: format!("{:x}", Sha256::digest(name.as_bytes())),
                modified_at: modified_at.clone(),
                size: PLACEHOLDER_MODEL_SIZE,
                details: ModelDetails {
                    parent_model: String::new(),
                    format: "gguf".to_string(),
                    family: "gemini".to_string(),
                    families: vec![display_name.clone()],
                    parameter_size: "N/A".to_string(),
                    quantization_level: "F16".to_string(),
                },
                display_name,
                name,
            }
        })
        .collect();

    ModelList { models }
}

/// OpenAI-style completion for `/v1/chat/completions`.
pub fn to_completion(response: &GenerateContentResponse, model: &str) -> ChatCompletion {
    let usage = response.usage_metadata.unwrap_or_default();
    let prompt_tokens = usage.prompt_token_count.unwrap_or(0);
    let completion_tokens = usage.candidates_token_count.unwrap_or(0);
    let created = Utc::now().timestamp();

    ChatCompletion {
        id: format!("chatcmpl-{created}"),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message: ResponseMessage::assistant(response.text()),
            finish_reason: done_reason(response.finish_reason()),
        }],
        usage: CompletionUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: usage
                .total_token_count
                .unwrap_or(prompt_tokens + completion_tokens),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemini_proxy_shared::ChatOptions;
    use serde_json::json;

    fn chat(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: "gemini-2.0-flash".to_string(),
            messages,
            stream: None,
            options: None,
            temperature: None,
            top_p: None,
            seed: None,
            stop: None,
        }
    }

    fn map(request: &ChatRequest) -> BackendRequest {
        to_backend_request(request, &PatchContext::default()).unwrap()
    }

    fn texts(content: &Content) -> Vec<&str> {
        content.parts.iter().filter_map(|p| p.text.as_deref()).collect()
    }

    #[test]
    fn zero_messages_is_invalid() {
        let err = to_backend_request(&chat(vec![]), &PatchContext::default()).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[test]
    fn omitted_options_use_defaults() {
        let backend = map(&chat(vec![ChatMessage::new(MessageRole::User, "hi")]));
        let config = &backend.body.generation_config;
        assert_eq!(config.temperature, 0.5);
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.seed, None);
        assert!(config.stop_sequences.is_empty());
        assert_eq!(config.top_k, None);
        assert_eq!(config.max_output_tokens, None);
    }

    #[test]
    fn options_take_precedence_over_top_level_fields() {
        let mut request = chat(vec![ChatMessage::new(MessageRole::User, "hi")]);
        request.temperature = Some(1.5);
        request.top_p = Some(0.3);
        request.stop = Some(vec!["TOP".to_string()]);
        request.seed = Some(7);
        request.options = Some(ChatOptions {
            temperature: Some(0.2),
            stop: Some(vec!["OPT".to_string()]),
            num_predict: Some(128),
            top_k: Some(40),
            ..Default::default()
        });

        let config = map(&request).body.generation_config;
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.top_p, 0.3);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.stop_sequences, vec!["OPT"]);
        assert_eq!(config.top_k, Some(40));
        assert_eq!(config.max_output_tokens, Some(128));
    }

    #[test]
    fn out_of_range_values_pass_through_and_seed_is_clamped() {
        let mut request = chat(vec![ChatMessage::new(MessageRole::User, "hi")]);
        request.options = Some(ChatOptions {
            temperature: Some(3.5),
            seed: Some(i64::MAX),
            num_predict: Some(-1),
            ..Default::default()
        });

        let config = map(&request).body.generation_config;
        assert_eq!(config.temperature, 3.5);
        assert_eq!(config.seed, Some(i32::MAX));
        assert_eq!(config.max_output_tokens, None);
    }

    #[test]
    fn system_messages_merge_into_instruction() {
        let backend = map(&chat(vec![
            ChatMessage::new(MessageRole::System, "Be terse."),
            ChatMessage::new(MessageRole::User, "hi"),
            ChatMessage::new(MessageRole::Assistant, "hello"),
            ChatMessage::new(MessageRole::System, "Use English."),
            ChatMessage::new(MessageRole::User, "again"),
        ]));

        let system = backend.body.system_instruction.unwrap();
        assert_eq!(system.role, None);
        assert_eq!(texts(&system), vec!["Be terse.\n\nUse English."]);

        let roles: Vec<&str> = backend
            .body
            .contents
            .iter()
            .map(|c| c.role.as_deref().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
    }

    #[test]
    fn unknown_roles_become_user() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "tool", "content": "result"}]
        }))
        .unwrap();
        let backend = map(&request);
        assert_eq!(backend.body.contents[0].role.as_deref(), Some("user"));
    }

    #[test]
    fn ide_style_first_user_message_is_promoted() {
        let backend = map(&chat(vec![
            ChatMessage::new(MessageRole::User, "You MUST answer in JSON."),
            ChatMessage::new(MessageRole::User, "list files"),
        ]));
        assert_eq!(
            texts(&backend.body.system_instruction.unwrap()),
            vec!["You MUST answer in JSON."]
        );
        assert_eq!(backend.body.contents.len(), 1);
    }

    #[test]
    fn lone_you_must_message_stays_a_turn() {
        let backend = map(&chat(vec![ChatMessage::new(MessageRole::User, "you must reply")]));
        assert!(backend.body.system_instruction.is_none());
        assert_eq!(backend.body.contents.len(), 1);
    }

    #[test]
    fn system_only_conversation_becomes_user_turn() {
        let backend = map(&chat(vec![ChatMessage::new(MessageRole::System, "Say hi")]));
        assert!(backend.body.system_instruction.is_none());
        assert_eq!(backend.body.contents.len(), 1);
        assert_eq!(backend.body.contents[0].role.as_deref(), Some("user"));
        assert_eq!(texts(&backend.body.contents[0]), vec!["Say hi"]);
    }

    #[test]
    fn images_are_forwarded_as_inline_data() {
        let mut message = ChatMessage::new(MessageRole::User, "what is this?");
        message.images = vec![
            "/9j/4AAQSkZJRg==".to_string(),
            "data:image/webp;base64,UklGRiQAAABXRUJQ".to_string(),
            "AAAA".to_string(),
        ];
        let backend = map(&chat(vec![message]));
        let parts = &backend.body.contents[0].parts;
        assert_eq!(parts.len(), 4);
        let blobs: Vec<(&str, &str)> = parts
            .iter()
            .filter_map(|p| p.inline_data.as_ref())
            .map(|b| (b.mime_type.as_str(), b.data.as_str()))
            .collect();
        assert_eq!(
            blobs,
            vec![
                ("image/jpeg", "/9j/4AAQSkZJRg=="),
                ("image/webp", "UklGRiQAAABXRUJQ"),
                ("image/png", "AAAA"),
            ]
        );
    }

    #[test]
    fn model_name_is_passed_verbatim() {
        let mut request = chat(vec![ChatMessage::new(MessageRole::User, "hi")]);
        request.model = "gemini-1.5-pro-latest".to_string();
        assert_eq!(map(&request).model, "gemini-1.5-pro-latest");
    }

    #[test]
    fn model_list_keeps_generative_models_only() {
        let list = to_model_list(vec![
            ModelInfo {
                name: "models/gemini-2.0-flash".to_string(),
                display_name: "Gemini 2.0 Flash".to_string(),
                supported_generation_methods: vec![
                    "generateContent".to_string(),
                    "countTokens".to_string(),
                ],
            },
            ModelInfo {
                name: "models/text-embedding-004".to_string(),
                display_name: "Text Embedding 004".to_string(),
                supported_generation_methods: vec!["embedContent".to_string()],
            },
        ]);

        assert_eq!(list.models.len(), 1);
        let card = &list.models[0];
        assert_eq!(card.name, "gemini-2.0-flash");
        assert_eq!(card.model, "gemini-2.0-flash");
        assert_eq!(card.display_name, "Gemini 2.0 Flash");
        assert_eq!(card.size, PLACEHOLDER_MODEL_SIZE);
        assert_eq!(card.digest.len(), 64);
        assert_eq!(card.digest, format!("{:x}", Sha256::digest(b"gemini-2.0-flash")));
        assert_eq!(card.details.families, vec!["Gemini 2.0 Flash"]);
        assert_eq!(card.details.family, "gemini");
        assert!(chrono::DateTime::parse_from_rfc3339(&card.modified_at).is_ok());
    }

    #[test]
    fn finish_reasons_map_to_done_reason() {
        assert_eq!(done_reason(None), "stop");
        assert_eq!(done_reason(Some("STOP")), "stop");
        assert_eq!(done_reason(Some("MAX_TOKENS")), "length");
        assert_eq!(done_reason(Some("SAFETY")), "safety");
    }

    #[test]
    fn backend_chunk_becomes_delta_record() {
        let chunk: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}]
        }))
        .unwrap();
        let record = from_backend_chunk(&chunk, "gemini-2.0-flash");
        assert!(!record.done);
        assert_eq!(record.model, "gemini-2.0-flash");
        assert_eq!(record.message.content, "Hel");
        assert_eq!(record.message.role, MessageRole::Assistant);
    }

    #[test]
    fn completion_carries_usage() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "Hello!"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2}
        }))
        .unwrap();
        let completion = to_completion(&response, "m");
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.choices[0].message.content, "Hello!");
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(completion.usage.total_tokens, 6);
    }
}
