//! Prompt templates and parsing of generative-model output.
//!
//! The analysis prompt asks the model for a single JSON object; parsing tries
//! that structured form first and falls back to scanning for labeled lines,
//! since the model is under no obligation to honor the requested schema.
//! Malformed output degrades to empty fields rather than an error, except
//! severity which defaults to `"medium"`.

use serde::{Deserialize, Serialize};

/// Number of trailing history turns included in a chat prompt.
const CHAT_HISTORY_WINDOW: usize = 6;

/// Severity used when the model response does not state one.
pub const DEFAULT_SEVERITY: &str = "medium";

/// Parsed result of an incident analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentAnalysis {
    /// Guidance addressed to the reporting user.
    pub user_solution: String,
    /// Reviewer-facing summary.
    pub summary: String,
    /// `low`, `medium`, or `high`.
    pub severity: String,
    /// Recommended next steps for safety or reporting.
    pub recommendation: String,
}

/// One prior user/AI exchange supplied with a follow-up request.
#[derive(Debug, Clone, Deserialize)]
pub struct FollowUpExchange {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub ai: String,
}

/// One prior message supplied with a chat request.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatHistoryTurn {
    pub sender: String,
    pub text: String,
}

/// Builds the analysis instruction for an incident report.
pub fn analysis_prompt(incident_text: &str) -> String {
    format!(
        "You are an AI safety assistant. Analyze this incident report:\n\
         \n\
         Incident: {incident_text}\n\
         \n\
         Respond with a single JSON object containing exactly these keys:\n\
         \"userSolution\": practical guidance for the person reporting,\n\
         \"adminSummary\": a 2-3 sentence summary for reviewers,\n\
         \"severity\": one of \"low\", \"medium\", \"high\",\n\
         \"recommendation\": recommended next steps for safety or reporting.\n\
         If you cannot produce JSON, respond with four lines prefixed\n\
         \"UserSolution:\", \"AdminSummary:\", \"Severity:\", \"Recommendation:\"."
    )
}

/// Builds the prompt continuing an incident's follow-up thread.
pub fn follow_up_prompt(
    incident_text: &str,
    conversation: &[FollowUpExchange],
    follow_up: &str,
) -> String {
    let mut context = String::new();
    context.push_str(incident_text);
    context.push('\n');
    for exchange in conversation {
        context.push_str(&format!("User: {}\nAI: {}\n", exchange.user, exchange.ai));
    }
    context.push_str(&format!("User follow-up: {follow_up}\n"));

    format!(
        "You are an AI safety assistant. Continue the conversation based on \
         previous incident analysis.\n\
         \n\
         Context: {context}\n\
         Provide a clear and actionable answer to the follow-up."
    )
}

/// Builds the free-form chat prompt over the trailing history window.
pub fn chat_prompt(history: &[ChatHistoryTurn], message: &str) -> String {
    let mut context = String::new();
    let start = history.len().saturating_sub(CHAT_HISTORY_WINDOW);
    for turn in &history[start..] {
        context.push_str(&format!("{}: {}\n", capitalize(&turn.sender), turn.text));
    }
    context.push_str(&format!("User: {message}\n"));

    format!(
        "You are an empathetic AI safety assistant for women. \
         Be clear, kind, and supportive. \
         Respond conversationally, not as a list.\n\
         \n\
         Conversation so far:\n{context}\n\
         Respond in a short, natural message."
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalysis {
    #[serde(default)]
    user_solution: String,
    #[serde(default, alias = "summary")]
    admin_summary: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    recommendation: String,
}

/// Parses a model analysis response into named fields.
pub fn parse_analysis(raw: &str) -> IncidentAnalysis {
    let body = strip_code_fence(raw);

    if let Ok(parsed) = serde_json::from_str::<RawAnalysis>(body) {
        return IncidentAnalysis {
            user_solution: parsed.user_solution.trim().to_string(),
            summary: parsed.admin_summary.trim().to_string(),
            severity: normalize_severity(&parsed.severity),
            recommendation: parsed.recommendation.trim().to_string(),
        };
    }

    parse_labeled_lines(body)
}

fn parse_labeled_lines(body: &str) -> IncidentAnalysis {
    let mut user_solution = String::new();
    let mut summary = String::new();
    let mut severity = String::new();
    let mut recommendation = String::new();

    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("UserSolution:") {
            user_solution = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("AdminSummary:") {
            summary = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("Severity:") {
            severity = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("Recommendation:") {
            recommendation = rest.trim().to_string();
        }
    }

    IncidentAnalysis {
        user_solution,
        summary,
        severity: normalize_severity(&severity),
        recommendation,
    }
}

fn normalize_severity(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_SEVERITY.to_string()
    } else {
        trimmed.to_string()
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        chat_prompt, follow_up_prompt, parse_analysis, ChatHistoryTurn, FollowUpExchange,
    };

    #[test]
    fn labeled_lines_map_to_fields() {
        let analysis = parse_analysis(
            "UserSolution: X\nAdminSummary: Y\nSeverity: high\nRecommendation: Z",
        );
        assert_eq!(analysis.user_solution, "X");
        assert_eq!(analysis.summary, "Y");
        assert_eq!(analysis.severity, "high");
        assert_eq!(analysis.recommendation, "Z");
    }

    #[test]
    fn missing_severity_defaults_to_medium() {
        let analysis = parse_analysis("UserSolution: stay alert\nAdminSummary: brief report");
        assert_eq!(analysis.severity, "medium");
        assert_eq!(analysis.recommendation, "");
    }

    #[test]
    fn unlabeled_output_degrades_to_empty_fields() {
        let analysis = parse_analysis("I am sorry, I cannot help with that.");
        assert_eq!(analysis.user_solution, "");
        assert_eq!(analysis.summary, "");
        assert_eq!(analysis.severity, "medium");
    }

    #[test]
    fn json_output_is_preferred() {
        let analysis = parse_analysis(
            r#"{"userSolution": "call a friend", "adminSummary": "verbal harassment", "severity": "low", "recommendation": "file a report"}"#,
        );
        assert_eq!(analysis.user_solution, "call a friend");
        assert_eq!(analysis.summary, "verbal harassment");
        assert_eq!(analysis.severity, "low");
        assert_eq!(analysis.recommendation, "file a report");
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let analysis = parse_analysis(
            "```json\n{\"userSolution\": \"A\", \"adminSummary\": \"B\", \"severity\": \"\", \"recommendation\": \"C\"}\n```",
        );
        assert_eq!(analysis.user_solution, "A");
        assert_eq!(analysis.severity, "medium");
    }

    #[test]
    fn chat_prompt_keeps_only_trailing_window() {
        let history: Vec<ChatHistoryTurn> = (0..10)
            .map(|i| ChatHistoryTurn {
                sender: if i % 2 == 0 { "user" } else { "ai" }.to_string(),
                text: format!("turn-{i}"),
            })
            .collect();

        let prompt = chat_prompt(&history, "what now?");
        assert!(!prompt.contains("turn-3"));
        assert!(prompt.contains("turn-4"));
        assert!(prompt.contains("turn-9"));
        assert!(prompt.contains("User: what now?"));
    }

    #[test]
    fn follow_up_prompt_embeds_incident_and_exchanges() {
        let prompt = follow_up_prompt(
            "someone followed me home",
            &[FollowUpExchange {
                user: "should I call the police?".to_string(),
                ai: "yes, and note the time".to_string(),
            }],
            "what if it happens again?",
        );
        assert!(prompt.contains("someone followed me home"));
        assert!(prompt.contains("User: should I call the police?"));
        assert!(prompt.contains("AI: yes, and note the time"));
        assert!(prompt.contains("User follow-up: what if it happens again?"));
    }
}
