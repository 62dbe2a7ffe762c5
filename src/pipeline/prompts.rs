use std::fmt::Write;
use tracing::debug;

use super::AnswerMode;
use crate::intent::QueryCategory;
use crate::llm::CompletionRequest;
use crate::schema::SchemaRegistry;
use crate::session::ConversationTurn;
use crate::util::truncate_chars;

const CLASSIFIER_SYSTEM: &str =
    "You classify business questions about a CRM database. Reply with a single JSON object and nothing else.";

const COACH_SYSTEM: &str = "You are an encouraging sales coach. Use the retrieved CRM data to give \
strategic, practical advice: point out what is going well, where attention is needed and one or two \
concrete next steps. Only cite figures that appear in the data.";

const DATA_SYSTEM: &str = "You are a precise CRM data analyst. Answer the question directly from the \
retrieved data, citing the exact figures and names it contains. If the data does not answer the \
question, say so. Never invent numbers, dates or records.";

fn conversation_block(turns: &[ConversationTurn], max_chars: usize) -> String {
    let mut out = String::new();
    for turn in turns {
        let _ = writeln!(out, "User: {}", truncate_chars(&turn.message, max_chars));
        if let Some(response) = &turn.response {
            let _ = writeln!(out, "Assistant: {}", truncate_chars(response, max_chars));
        }
    }
    out
}

pub fn classification_request(
    registry: &SchemaRegistry,
    question: &str,
    recent: &[ConversationTurn],
) -> CompletionRequest {
    let categories: Vec<&str> = QueryCategory::ALL.iter().map(|c| c.as_str()).collect();
    let history = conversation_block(recent, 300);

    let prompt = format!(
        r#"
### Instructions:
Classify the question below against the CRM schema.
- **category** must be one of: {}
- **tables** lists every table whose columns the question needs, primary table first
- **filters** maps "table.column" to a value, or to an object like {{"gte": 70}} or {{"in": ["a", "b"]}}
- **aggregationType** is null, or {{"type": COUNT | SUM | AVG | MIN | MAX, "field": "table.column"}}
- **timeRange** uses phrases like "this month", "last 7 days", or ISO dates
- **confidence** is a number between 0 and 1

### Schema:
{}

### Recent conversation:
{}

### Question:
{}

### Response format:
{{"category": "...", "tables": ["..."], "filters": {{}}, "aggregationType": null, "groupBy": [], "timeRange": {{"start": null, "end": null}}, "confidence": 0.0, "explanation": "..."}}
"#,
        categories.join(", "),
        registry.to_ddl(),
        if history.is_empty() { "(none)" } else { history.trim_end() },
        question
    );

    debug!("Prepared classification prompt ({} chars)", prompt.len());
    CompletionRequest::new(CLASSIFIER_SYSTEM, prompt).json()
}

pub fn answer_request(
    mode: AnswerMode,
    question: &str,
    grounding: &str,
    recent: &[ConversationTurn],
) -> CompletionRequest {
    let (system, temperature) = match mode {
        AnswerMode::Coach => (COACH_SYSTEM, 0.5),
        AnswerMode::Data => (DATA_SYSTEM, 0.1),
    };
    let history = conversation_block(recent, 500);

    let prompt = format!(
        r#"
### Retrieved data:
{}

### Recent conversation:
{}

### Question:
{}

### Response:
"#,
        grounding.trim_end(),
        if history.is_empty() { "(none)" } else { history.trim_end() },
        question
    );

    debug!("Prepared {} answer prompt ({} chars)", mode.as_str(), prompt.len());
    CompletionRequest::new(system, prompt).with_temperature(temperature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(message: &str, response: Option<&str>) -> ConversationTurn {
        ConversationTurn {
            session_id: "s1".into(),
            user_id: "u1".into(),
            message: message.into(),
            response: response.map(str::to_string),
            mode: AnswerMode::Data,
            intent: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn classification_prompt_carries_schema_and_history() {
        let registry = SchemaRegistry::crm_default().unwrap();
        let request = classification_request(
            &registry,
            "and last month?",
            &[turn("deals closed this month?", Some("Three deals closed."))],
        );
        assert!(request.json);
        assert!(request.prompt.contains("CREATE TABLE deals"));
        assert!(request.prompt.contains("ENGAGEMENT_ANALYSIS"));
        assert!(request.prompt.contains("User: deals closed this month?"));
        assert!(request.prompt.contains("Assistant: Three deals closed."));
    }

    #[test]
    fn answer_prompt_depends_on_mode() {
        let coach = answer_request(AnswerMode::Coach, "how am I doing?", "Rows returned: 1", &[]);
        let data = answer_request(AnswerMode::Data, "how am I doing?", "Rows returned: 1", &[]);
        assert!(coach.system.contains("coach"));
        assert!(data.system.contains("analyst"));
        assert!(data.prompt.contains("(none)"));
        assert!(!data.json);
    }
}
