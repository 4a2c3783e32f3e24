use std::sync::Arc;

use palaver_common::ChatMessage;
use tracing::{info, warn};

use crate::providers::{ChatRequest, LlmProvider};

pub const GENERAL: &str = "GENERAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Complex,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub intent: String,
    pub complexity: Complexity,
}

impl Classification {
    fn general_simple() -> Self {
        Self { intent: GENERAL.to_string(), complexity: Complexity::Simple }
    }
}

/// Classify a user turn with one cheap completion call. The classifier
/// never fails a turn: unparseable or errored output degrades to
/// `(GENERAL, SIMPLE)`, which routes to the fast path.
///
/// Turns carrying media bypass the call entirely — media understanding has
/// its own model-selection path.
pub async fn classify(
    provider: &Arc<dyn LlmProvider>,
    model: &str,
    user_input: &str,
    categories: &[String],
    has_media: bool,
) -> Classification {
    if has_media {
        return Classification::general_simple();
    }

    let request = ChatRequest {
        messages: vec![
            ChatMessage::system(classifier_prompt(categories)),
            ChatMessage::user(user_input),
        ],
        model: model.to_string(),
        temperature: 0.1,
        max_tokens: 20,
        tools: vec![],
    };

    match provider.complete(&request).await {
        Ok(response) => {
            let classification = parse_classifier_output(&response.message.content, categories);
            info!(
                intent = %classification.intent,
                complex = classification.complexity == Complexity::Complex,
                "classified turn"
            );
            classification
        }
        Err(e) => {
            warn!("intent classification failed, defaulting to GENERAL/SIMPLE: {e}");
            Classification::general_simple()
        }
    }
}

fn classifier_prompt(categories: &[String]) -> String {
    let mut lines = Vec::new();
    for cat in categories {
        let desc = match cat.as_str() {
            "GIT" => "   GIT: Version control, commits, branches, diffs, blame.".to_string(),
            "FILESYSTEM" => {
                "   FILESYSTEM: Reading/writing files, listing directories, searching files."
                    .to_string()
            }
            "FETCH" => {
                "   FETCH: Web requests, URLs, downloading content from the internet.".to_string()
            }
            "GENERAL" => {
                "   GENERAL: General knowledge, coding advice, greetings, math, explanations."
                    .to_string()
            }
            other => format!("   {other}: Tools for {} operations.", other.to_lowercase()),
        };
        lines.push(desc);
    }

    format!(
        "You are a query analyzer. Given the user's message, output TWO things.\n\n\
         1. INTENT - which category of tools is needed:\n{}\n\n\
         2. COMPLEXITY - how many steps are needed:\n\
         \x20  SIMPLE: Can be answered in ONE step (single tool call or direct knowledge).\n\
         \x20    Examples: 'What is Python?', 'Read file.py', 'Show git status'\n\
         \x20  COMPLEX: Needs MULTIPLE steps where later steps depend on earlier results.\n\
         \x20    Examples: 'Read error log AND find the bug in source code',\n\
         \x20             'Compare files A and B and summarize differences'\n\n\
         \x20  Signals of COMPLEX:\n\
         \x20    - Multiple files/resources/actions mentioned\n\
         \x20    - Sequential words: 'and then', 'after that', 'first...then'\n\
         \x20    - Analysis words: 'compare', 'analyze', 'debug', 'investigate', 'research'\n\n\
         Output EXACTLY two lines, nothing else:\n\
         INTENT: <category>\n\
         COMPLEXITY: <level>",
        lines.join("\n")
    )
}

/// Tolerant line-oriented parser for the classifier's two-line reply.
/// Case- and whitespace-insensitive; substring fallback matches the
/// longest category first so FILESYSTEM wins over a hypothetical FILE.
fn parse_classifier_output(text: &str, categories: &[String]) -> Classification {
    let upper = text.to_uppercase();

    let mut intent = GENERAL.to_string();
    let mut sorted: Vec<&String> = categories.iter().collect();
    sorted.sort_by_key(|c| std::cmp::Reverse(c.len()));

    'outer: for line in upper.lines() {
        let clean = line.replace("INTENT:", "");
        let clean = clean.trim();
        for cat in &sorted {
            let cat_upper = cat.to_uppercase();
            if clean == cat_upper || clean.contains(&cat_upper) {
                intent = cat_upper;
                break 'outer;
            }
        }
    }

    let mut complexity = Complexity::Simple;
    for line in upper.lines() {
        if let Some(idx) = line.find("COMPLEXITY") {
            if line[idx + "COMPLEXITY".len()..].contains("COMPLEX") {
                complexity = Complexity::Complex;
            }
        }
    }

    Classification { intent, complexity }
}
