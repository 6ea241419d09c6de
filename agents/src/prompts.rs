//! Prompt construction for the LLM-backed agents.
//!
//! Wording is an implementation detail; the contracts are functional:
//! answers must come from the provided sources and cite them, assessments
//! must return a machine-readable rubric.

use corpora_ai::ChatMessage;
use corpora_models::search::RetrievedChunk;

/// Tag each passage with its position and originating mode so the model can
/// attribute claims to sources.
pub fn source_block(passages: &[RetrievedChunk]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let modes: Vec<&str> = p.matched_modes.iter().map(|m| m.as_str()).collect();
            let via = if modes.is_empty() {
                "search".to_string()
            } else {
                modes.join("+")
            };
            format!("[source {}] (via {}) {}", i + 1, via, p.content.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Primary synthesis prompt: source-bound, citation-required.
pub fn synthesis_messages(
    query: &str,
    passages: &[RetrievedChunk],
    history: &[ChatMessage],
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(
        "You answer questions strictly from the provided sources. \
         Cite sources inline as [source N]. If the sources do not contain \
         the answer, say so instead of guessing.",
    )];
    messages.extend_from_slice(history);
    messages.push(ChatMessage::user(format!(
        "Sources:\n\n{}\n\nQuestion: {}",
        source_block(passages),
        query
    )));
    messages
}

/// Simplified fallback used after a primary synthesis failure.
pub fn fallback_messages(query: &str, passages: &[RetrievedChunk]) -> Vec<ChatMessage> {
    let condensed: String = passages
        .iter()
        .take(3)
        .map(|p| p.content.trim())
        .collect::<Vec<_>>()
        .join("\n");
    vec![ChatMessage::user(format!(
        "Answer briefly from this text:\n{}\n\nQuestion: {}",
        condensed, query
    ))]
}

/// Quality rubric prompt; the model must answer with a JSON object.
pub fn assessment_messages(query: &str, answer: &str, passages: &[RetrievedChunk]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You grade answers against their sources. Reply with only a JSON \
             object: {\"completeness\": 0-1, \"accuracy\": 0-1, \"clarity\": 0-1, \
             \"consistency\": 0-1}.",
        ),
        ChatMessage::user(format!(
            "Question: {}\n\nAnswer:\n{}\n\nSources:\n\n{}",
            query,
            answer,
            source_block(passages)
        )),
    ]
}

/// Decomposition prompt for the coordinator.
pub fn decomposition_messages(query: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(format!(
        "Break the question below into at most 4 self-contained sub-questions, \
         one per line, no numbering. If it is already simple, return it unchanged.\n\
         Question: {}",
        query
    ))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpora_models::chunk::ChunkType;
    use corpora_models::search::SearchMode;
    use uuid::Uuid;

    fn passage(content: &str, mode: SearchMode) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            knowledge_base_id: Uuid::nil(),
            chunk_index: 0,
            content: content.into(),
            score: 0.9,
            chunk_type: ChunkType::Text,
            matched_modes: vec![mode],
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn sources_are_numbered_and_mode_tagged() {
        let block = source_block(&[
            passage("Paris is the capital.", SearchMode::Semantic),
            passage("France borders Germany.", SearchMode::Graph),
        ]);
        assert!(block.contains("[source 1] (via semantic)"));
        assert!(block.contains("[source 2] (via graph)"));
    }

    #[test]
    fn synthesis_prompt_carries_history_and_question() {
        let messages = synthesis_messages(
            "capital of France?",
            &[passage("Paris.", SearchMode::Hybrid)],
            &[ChatMessage::user("earlier turn")],
        );
        assert_eq!(messages[0].role, "system");
        assert!(messages.iter().any(|m| m.content == "earlier turn"));
        assert!(messages.last().unwrap().content.contains("capital of France?"));
    }
}
