//! Chat flow end-to-end: event sequences, tool round-trips, and stream
//! invariants, driven with a scripted model router.

mod common;

use common::*;
use flowgraph_checkpoint::CheckpointStore;
use flowgraph_core::MessageRole;
use relay::emitter::envelope::EventType;
use relay::flows::FLOW_CHAT;
use serde_json::json;

fn chat_script(
    request: &llm_gateway::ChatRequest,
) -> Result<llm_gateway::ChatResponse, llm_gateway::GatewayError> {
    if !has_tool_reply(request) && last_human(request).contains("PR-") {
        return Ok(ai_tool_call("get_procedure", json!({"id": "PR-AV-02"})));
    }
    Ok(ai_text("Dit is het antwoord."))
}

#[tokio::test]
async fn plain_chat_produces_expected_sequence() {
    let harness = harness(chat_script, |_| {});
    let input = json!({"messages": [{"role": "human", "content": "Hallo"}]});
    let envelopes = run_and_collect(&harness, FLOW_CHAT, "11111111-1111-1111-1111-111111111111", Some(input), None).await;

    assert_seq_monotonic(&envelopes);
    assert_node_pairs(&envelopes);

    let kinds: Vec<EventType> = envelopes.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds.first(), Some(&EventType::GraphStart));

    // graph_start .. node_start(agent) .. llm_start .. content_chunk+ ..
    // llm_end .. node_end(agent) .. graph_end
    let agent_start = kinds
        .iter()
        .position(|k| *k == EventType::NodeStart)
        .expect("agent node_start");
    let llm_start = kinds
        .iter()
        .position(|k| *k == EventType::LlmStart)
        .expect("llm_start");
    let first_chunk = kinds
        .iter()
        .position(|k| *k == EventType::ContentChunk)
        .expect("content chunks");
    let llm_end = kinds
        .iter()
        .position(|k| *k == EventType::LlmEnd)
        .expect("llm_end");
    let graph_end = kinds
        .iter()
        .position(|k| *k == EventType::GraphEnd)
        .expect("graph_end");
    assert!(agent_start < llm_start && llm_start < first_chunk);
    assert!(first_chunk < llm_end && llm_end < graph_end);

    let end = events_of(&envelopes, EventType::GraphEnd)[0];
    assert_eq!(end.payload["response"], "Dit is het antwoord.");

    // accumulated content grows across chunks
    let chunks = events_of(&envelopes, EventType::ContentChunk);
    assert!(chunks.len() >= 2);
    assert_eq!(
        chunks.last().unwrap().payload["accumulated"],
        "Dit is het antwoord."
    );
}

#[tokio::test]
async fn tool_call_round_trip_inserts_tool_events() {
    let harness = harness(chat_script, |_| {});
    let input = json!({"messages": [{"role": "human", "content": "zoek PR-AV-02 op"}]});
    let thread_id = "22222222-2222-2222-2222-222222222222";
    let envelopes = run_and_collect(&harness, FLOW_CHAT, thread_id, Some(input), None).await;

    assert_seq_monotonic(&envelopes);
    assert_node_pairs(&envelopes);

    let tool_starts = events_of(&envelopes, EventType::ToolStart);
    let tool_ends = events_of(&envelopes, EventType::ToolEnd);
    assert_eq!(tool_starts.len(), 1);
    assert_eq!(tool_ends.len(), 1);
    assert_eq!(tool_starts[0].payload["tool_name"], "get_procedure");
    assert!(tool_ends[0].payload["result_preview"]
        .as_str()
        .unwrap()
        .contains("PR-AV-02"));

    // two agent passes: one requesting the tool, one answering
    assert_eq!(node_starts_for(&envelopes, "agent").len(), 2);

    // second pass streamed the final answer after the tool events
    let kinds: Vec<EventType> = envelopes.iter().map(|e| e.event_type).collect();
    let tool_end_pos = kinds
        .iter()
        .position(|k| *k == EventType::ToolEnd)
        .unwrap();
    let last_chunk_pos = kinds
        .iter()
        .rposition(|k| *k == EventType::ContentChunk)
        .unwrap();
    assert!(tool_end_pos < last_chunk_pos);

    // chat invariant: the checkpointed conversation answers every tool call
    // before the next ai message
    let checkpoint = harness
        .checkpoints
        .get_latest(thread_id)
        .await
        .unwrap()
        .unwrap();
    let messages = flowgraph_core::messages_from_value(&checkpoint.values["messages"]).unwrap();
    let mut open_calls: Vec<String> = Vec::new();
    for message in &messages {
        match message.role {
            MessageRole::Ai => {
                assert!(open_calls.is_empty(), "ai message before tool replies");
                open_calls = message.tool_calls.iter().map(|c| c.call_id.clone()).collect();
            }
            MessageRole::Tool => {
                let call_id = message.tool_call_id.clone().unwrap();
                let idx = open_calls.iter().position(|c| *c == call_id).unwrap();
                open_calls.remove(idx);
            }
            _ => {}
        }
    }
    assert!(open_calls.is_empty());
}

#[tokio::test]
async fn second_turn_extends_the_same_thread() {
    let harness = harness(chat_script, |_| {});
    let thread_id = "33333333-3333-3333-3333-333333333333";
    let first = json!({"messages": [{"role": "human", "content": "Hallo"}]});
    run_and_collect(&harness, FLOW_CHAT, thread_id, Some(first), None).await;

    let second = json!({"messages": [{"role": "human", "content": "En nog iets"}]});
    run_and_collect(&harness, FLOW_CHAT, thread_id, Some(second), None).await;

    let checkpoint = harness
        .checkpoints
        .get_latest(thread_id)
        .await
        .unwrap()
        .unwrap();
    let messages = flowgraph_core::messages_from_value(&checkpoint.values["messages"]).unwrap();
    let humans: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::Human)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(humans, vec!["Hallo", "En nog iets"]);

    // lineage is a single tree: the ancestry reaches back to the first turn
    let ancestry = harness.checkpoints.list_ancestry(thread_id).await.unwrap();
    assert!(ancestry.len() >= 4);
    assert!(ancestry.last().unwrap().parent_id.is_none());
}

#[tokio::test]
async fn llm_end_carries_execution_metrics() {
    let harness = harness(chat_script, |_| {});
    let input = json!({"messages": [{"role": "human", "content": "Hallo"}]});
    let envelopes = run_and_collect(&harness, FLOW_CHAT, "44444444-4444-4444-4444-444444444444", Some(input), None).await;

    let llm_end = events_of(&envelopes, EventType::LlmEnd)[0];
    let metrics = &llm_end.payload["execution_metrics"];
    assert!(metrics.is_object(), "llm_end without execution metrics");
    assert!(metrics["ttft_ms"].is_u64() || metrics["ttft_ms"].is_null());
    assert_eq!(llm_end.payload["token_usage"]["input_tokens"], 10);
}
