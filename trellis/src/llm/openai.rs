//! OpenAI-compatible Chat Completions client implementing [`LlmClient`].
//!
//! Requires `OPENAI_API_KEY` (or explicit config with a custom base URL for
//! compatible providers). Tool schemas are forwarded as function tools; the
//! streaming path accumulates content and tool-call deltas and still returns
//! the complete response.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::debug;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionMessageToolCalls, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessage,
        ChatCompletionTool, ChatCompletionTools, CreateChatCompletionRequestArgs, FunctionObject,
    },
    Client,
};

use super::{ChatRequest, ChatResponse, LlmClient, LlmError, LlmUsage, MessageChunk};
use crate::message::{Message, Role, ToolCall};

/// Chat Completions client for OpenAI and compatible gateways.
pub struct OpenAiChat {
    client: Client<OpenAIConfig>,
}

impl OpenAiChat {
    /// API key from `OPENAI_API_KEY`, default base URL.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Custom key/base URL (any OpenAI-compatible provider).
    pub fn with_config(config: OpenAIConfig) -> Self {
        Self {
            client: Client::with_config(config),
        }
    }

    fn to_request_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let mut out = Vec::with_capacity(messages.len());
        for m in messages {
            let converted = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessage::from(m.content.as_str()),
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage::from(m.content.as_str()),
                ),
                Role::Assistant => {
                    let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                    args.content(m.content.as_str());
                    if !m.tool_calls.is_empty() {
                        let calls: Vec<ChatCompletionMessageToolCalls> = m
                            .tool_calls
                            .iter()
                            .map(|c| {
                                serde_json::from_value(serde_json::json!({
                                    "id": c.id,
                                    "type": "function",
                                    "function": {"name": c.name, "arguments": c.arguments},
                                }))
                                .map_err(|e| {
                                    LlmError::Fatal(format!("tool call encode: {}", e))
                                })
                            })
                            .collect::<Result<_, _>>()?;
                        args.tool_calls(calls);
                    }
                    ChatCompletionRequestMessage::Assistant(
                        args.build()
                            .map_err(|e| LlmError::Fatal(format!("request build: {}", e)))?,
                    )
                }
                Role::Tool => ChatCompletionRequestMessage::Tool(
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(m.content.as_str())
                        .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                        .build()
                        .map_err(|e| LlmError::Fatal(format!("request build: {}", e)))?,
                ),
            };
            out.push(converted);
        }
        Ok(out)
    }

    fn build_request(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<async_openai::types::chat::CreateChatCompletionRequest, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(req.model.clone());
        args.messages(Self::to_request_messages(&req.messages)?);
        if stream {
            args.stream(true);
        }
        if !req.tools.is_empty() {
            let chat_tools: Vec<ChatCompletionTools> = req
                .tools
                .iter()
                .map(|t| {
                    ChatCompletionTools::Function(ChatCompletionTool {
                        function: FunctionObject {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: Some(t.parameters.clone()),
                            ..Default::default()
                        },
                    })
                })
                .collect();
            args.tools(chat_tools);
        }
        if let Some(t) = req.options.temperature {
            args.temperature(t);
        }
        if let Some(m) = req.options.max_tokens {
            args.max_completion_tokens(m);
        }
        args.build()
            .map_err(|e| LlmError::Fatal(format!("request build: {}", e)))
    }
}

impl Default for OpenAiChat {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits provider failures into retryable and terminal, per the run-level
/// error taxonomy: connection problems, 429s, and 5xx retry; everything else
/// (schema, auth, other 4xx) surfaces immediately.
fn classify(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) => LlmError::Transient(format!("http: {}", e)),
        OpenAIError::StreamError(e) => LlmError::Transient(format!("stream: {}", e)),
        OpenAIError::ApiError(api) => {
            let code = api
                .code
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_default();
            let kind = api.r#type.clone().unwrap_or_default();
            let retryable = code.contains("429")
                || code.contains("5")
                || kind.contains("rate_limit")
                || kind.contains("overloaded")
                || kind.contains("server_error");
            let text = format!("api error ({}): {}", kind, api.message);
            if retryable {
                LlmError::Transient(text)
            } else {
                LlmError::Fatal(text)
            }
        }
        other => LlmError::Fatal(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiChat {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        let request = self.build_request(&req, false)?;
        debug!(model = %req.model, messages = req.messages.len(), tools = req.tools.len(), "chat create");

        let response = self.client.chat().create(request).await.map_err(classify)?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Fatal("provider returned no choices".into()))?;

        let msg = choice.message;
        let tool_calls: Vec<ToolCall> = msg
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tc| {
                if let ChatCompletionMessageToolCalls::Function(f) = tc {
                    Some(ToolCall {
                        id: f.id,
                        name: f.function.name,
                        arguments: f.function.arguments,
                    })
                } else {
                    None
                }
            })
            .collect();

        Ok(ChatResponse {
            content: msg.content.unwrap_or_default(),
            tool_calls,
            usage: response.usage.map(|u| LlmUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<ChatResponse, LlmError> {
        let Some(chunk_tx) = chunk_tx else {
            return self.chat(req).await;
        };

        let request = self.build_request(&req, true)?;
        debug!(model = %req.model, messages = req.messages.len(), stream = true, "chat create_stream");

        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(classify)?;

        let mut full_content = String::new();
        let mut sent_any = false;
        // index -> (id, name, arguments), accumulated across deltas
        let mut calls: std::collections::BTreeMap<u32, (String, String, String)> =
            std::collections::BTreeMap::new();
        let mut usage: Option<LlmUsage> = None;

        while let Some(result) = stream.next().await {
            let chunk = result.map_err(classify)?;
            if let Some(ref u) = chunk.usage {
                usage = Some(LlmUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                });
            }
            for choice in chunk.choices {
                let delta = &choice.delta;
                if let Some(ref content) = delta.content {
                    if !content.is_empty() {
                        full_content.push_str(content);
                        sent_any = true;
                        let _ = chunk_tx
                            .send(MessageChunk {
                                content: content.clone(),
                            })
                            .await;
                    }
                }
                if let Some(ref tool_calls) = delta.tool_calls {
                    for tc in tool_calls {
                        let entry = calls.entry(tc.index).or_default();
                        if let Some(ref id) = tc.id {
                            if !id.is_empty() {
                                entry.0 = id.clone();
                            }
                        }
                        if let Some(ref func) = tc.function {
                            if let Some(ref name) = func.name {
                                entry.1.push_str(name);
                            }
                            if let Some(ref arguments) = func.arguments {
                                entry.2.push_str(arguments);
                            }
                        }
                    }
                }
            }
        }

        // Some gateways send content only in the final payload, not in
        // deltas; emit it as one chunk so the stream still carries text.
        if !sent_any && !full_content.is_empty() {
            let _ = chunk_tx
                .send(MessageChunk {
                    content: full_content.clone(),
                })
                .await;
        }

        Ok(ChatResponse {
            content: full_content,
            tool_calls: calls
                .into_values()
                .map(|(id, name, arguments)| ToolCall {
                    id,
                    name,
                    arguments,
                })
                .collect(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_all_roles() {
        let messages = vec![
            Message::system("s"),
            Message::user("u"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall {
                    id: "call_1".into(),
                    name: "read".into(),
                    arguments: "{}".into(),
                }],
            ),
            Message::tool("call_1", "result"),
        ];
        let converted = OpenAiChat::to_request_messages(&messages).unwrap();
        assert_eq!(converted.len(), 4);
    }

    #[test]
    fn api_rate_limit_is_transient() {
        let err = OpenAIError::ApiError(async_openai::error::ApiError {
            message: "slow down".into(),
            r#type: Some("rate_limit_exceeded".into()),
            param: None,
            code: None,
        });
        assert!(classify(err).is_transient());
    }

    #[test]
    fn api_schema_error_is_fatal() {
        let err = OpenAIError::ApiError(async_openai::error::ApiError {
            message: "bad schema".into(),
            r#type: Some("invalid_request_error".into()),
            param: None,
            code: None,
        });
        assert!(!classify(err).is_transient());
    }
}
