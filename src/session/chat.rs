//! One LLM turn: transcript in, sentences and tool calls out.
//!
//! Drives the model stream through the normalized tool-call parser,
//! feeds completed sentences to the TTS queue tagged FIRST/MIDDLE/LAST,
//! and on a tool call records the ToolCall/ToolResponse pair and either
//! re-enters the model (REQLLM) or speaks the result directly.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::dialogue::Message;
use crate::protocol::ServerEnvelope;
use crate::providers::llm::{LlmEvent, ToolCallRequest, ToolCallStreamParser};
use crate::providers::IntentKind;
use crate::session::emotion::detect_emotion;
use crate::session::segment::SentenceSegmenter;
use crate::session::tts_out::{SentenceOrdinal, TtsJob};
use crate::session::Session;
use crate::tools::ActionResponse;

/// Tool-call rounds allowed inside one user turn.
const MAX_TOOL_DEPTH: usize = 5;

/// Run a turn. Depth 0 is the user's transcript; deeper levels re-enter
/// the model with tool results.
pub fn run_turn(session: Arc<Session>, query: String, depth: usize) -> BoxFuture<'static, ()> {
    async move {
        if depth > MAX_TOOL_DEPTH {
            warn!(depth, "tool depth budget exceeded, stopping turn");
            return;
        }
        session.set_llm_busy(true);
        turn_inner(&session, query, depth).await;
        if depth == 0 {
            let sentence_id = session.current_sentence_id().unwrap_or_default();
            session
                .enqueue_tts(TtsJob::action(&sentence_id, SentenceOrdinal::Last))
                .await;
            session.set_llm_busy(false);
        }
    }
    .boxed()
}

async fn turn_inner(session: &Arc<Session>, query: String, depth: usize) {
    let Some(adapters) = session.adapters_snapshot().await else {
        warn!("turn requested before adapters ready");
        return;
    };

    let sentence_id = if depth == 0 {
        let id = Uuid::new_v4().simple().to_string();
        session.set_sentence_id(&id);
        session.clear_abort();
        session.dialogue.lock().await.put(Message::User(query.clone()));
        session
            .enqueue_tts(TtsJob::action(&id, SentenceOrdinal::First))
            .await;
        id
    } else {
        session.current_sentence_id().unwrap_or_default()
    };

    // Memory retrieval only enriches the user's own query; tool results
    // re-enter without another lookup.
    let memory_context = if depth == 0 {
        match adapters.memory.query_memory(&query).await {
            Ok(context) => context,
            Err(e) => {
                debug!(error = %e, "memory lookup failed, continuing without");
                None
            }
        }
    } else {
        None
    };

    let tools = if adapters.intent.kind() == IntentKind::FunctionCall {
        session
            .tools_snapshot()
            .await
            .map(|runtime| runtime.manager.function_descriptions())
            .filter(|descs| !descs.is_empty())
    } else {
        None
    };

    let view = session
        .dialogue
        .lock()
        .await
        .llm_view_with_memory(memory_context.as_deref());

    // One retry on transient transport failure, then degrade to a spoken
    // apology.
    let mut stream = match adapters.llm.stream_chat(view.clone(), tools.clone()).await {
        Ok(stream) => stream,
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "llm request failed, retrying once");
            match adapters.llm.stream_chat(view, tools).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "llm retry failed");
                    session.speak_now("Sorry, I can't think right now.").await;
                    return;
                }
            }
        }
        Err(e) => {
            error!(error = %e, "llm request failed");
            session.speak_now("Sorry, I can't think right now.").await;
            return;
        }
    };

    let mut parser = ToolCallStreamParser::new();
    let mut segmenter = SentenceSegmenter::new();
    let mut prose = String::new();
    let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
    let mut emotion_sent = depth != 0;

    while let Some(chunk) = stream.next().await {
        if session.is_aborted() {
            debug!("client abort during llm stream");
            break;
        }
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(error = %e, "llm stream error");
                break;
            }
        };

        for event in parser.push(&chunk) {
            match event {
                LlmEvent::Text(text) => {
                    if !emotion_sent && !text.trim().is_empty() {
                        emotion_sent = true;
                        session
                            .send_envelope(ServerEnvelope::Emotion {
                                emotion: detect_emotion(&text).to_string(),
                                session_id: session.session_id.clone(),
                            })
                            .await;
                    }
                    prose.push_str(&text);
                    for sentence in segmenter.push(&text) {
                        session
                            .enqueue_tts(TtsJob::sentence(&sentence_id, sentence))
                            .await;
                    }
                }
                LlmEvent::ToolCall(call) => tool_calls.push(call),
            }
        }
    }

    for event in parser.finish() {
        match event {
            LlmEvent::Text(text) => {
                prose.push_str(&text);
                for sentence in segmenter.push(&text) {
                    session
                        .enqueue_tts(TtsJob::sentence(&sentence_id, sentence))
                        .await;
                }
            }
            LlmEvent::ToolCall(call) => tool_calls.push(call),
        }
    }
    if let Some(rest) = segmenter.finish() {
        session
            .enqueue_tts(TtsJob::sentence(&sentence_id, rest))
            .await;
    }

    // Record the assistant prose. Every LLM output stream yields exactly
    // one Assistant message, possibly empty, so the dialogue shape stays
    // uniform.
    session
        .dialogue
        .lock()
        .await
        .put(Message::Assistant(prose.trim().to_string()));

    if tool_calls.is_empty() {
        return;
    }

    let Some(runtime) = session.tools_snapshot().await else {
        warn!("tool call with no tool runtime");
        return;
    };

    let mut responses = Vec::with_capacity(tool_calls.len());
    for call in &tool_calls {
        session.dialogue.lock().await.put(Message::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });
        let response = runtime.dispatcher.handle_call(call).await;
        debug!(tool = %call.name, ?response, "tool call finished");
        responses.push((call.id.clone(), response));
    }

    let combined = ActionResponse::combine(
        responses.iter().map(|(_, r)| r.clone()).collect(),
    );

    match combined {
        ActionResponse::ReqLlm(result) => {
            record_tool_responses(session, &responses, "").await;
            run_turn(session.clone(), result, depth + 1).await;
        }
        ActionResponse::Response(text) => {
            record_tool_responses(session, &responses, &text).await;
            speak_and_record(session, &sentence_id, &text).await;
        }
        ActionResponse::Error(text) => {
            record_tool_responses(session, &responses, &text).await;
            speak_and_record(session, &sentence_id, &text).await;
        }
        ActionResponse::NotFound => {
            let text = "I don't have a tool for that.".to_string();
            record_tool_responses(session, &responses, &text).await;
            speak_and_record(session, &sentence_id, &text).await;
        }
        ActionResponse::None => {
            record_tool_responses(session, &responses, "").await;
        }
    }
}

async fn record_tool_responses(
    session: &Arc<Session>,
    responses: &[(String, ActionResponse)],
    fallback: &str,
) {
    for (id, response) in responses {
        let content = match response {
            ActionResponse::ReqLlm(text) | ActionResponse::Response(text) => text.clone(),
            ActionResponse::Error(text) => text.clone(),
            ActionResponse::NotFound => "tool not found".to_string(),
            ActionResponse::None => fallback.to_string(),
        };
        session.dialogue.lock().await.put(Message::ToolResponse {
            tool_call_id: id.clone(),
            content,
        });
    }
}

async fn speak_and_record(session: &Arc<Session>, sentence_id: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    for sentence in crate::session::segment::split_sentences(text) {
        session
            .enqueue_tts(TtsJob::sentence(sentence_id, sentence))
            .await;
    }
    session
        .dialogue
        .lock()
        .await
        .put(Message::Assistant(text.to_string()));
}
