use std::collections::HashSet;

use palaver_common::{ChatMessage, Result, Role, StreamChunk};
use tokio::sync::mpsc;
use tracing::info;

use crate::orchestrator::{emit, ChatOrchestrator};
use crate::providers::{ChatRequest, ToolSchema};
use crate::salvage::salvage_tool_calls;

/// Plan + ReAct execution for COMPLEX turns. A planner call produces a
/// short numbered plan, then each round lets the model call tools against
/// the current step, feeding results back until it answers in text. The
/// round count shares the turn's iteration ceiling.
pub(crate) async fn run_agentic_path(
    orc: &ChatOrchestrator,
    conversation_id: &str,
    mut messages: Vec<ChatMessage>,
    model: &str,
    mut tools: Vec<ToolSchema>,
    user_text: &str,
    summary: Option<&str>,
    tx: &mpsc::Sender<StreamChunk>,
) -> Result<i64> {
    let max_rounds = orc.config().tools.max_tool_turns;
    let tool_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();

    let plan = create_plan(orc, model, user_text, &tool_names, summary).await;
    let total_steps = plan.len();

    let plan_text = plan
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {step}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    emit(tx, StreamChunk::status(format!("Plan ({total_steps} steps):\n{plan_text}"))).await?;

    // Fold the agentic discipline into the existing system message.
    let agentic_prompt = agentic_system_prompt(&plan, &tool_names, max_rounds);
    match messages.first_mut() {
        Some(system) if system.role == Role::System => {
            system.content = format!("{}\n\n{agentic_prompt}", system.content);
        }
        _ => messages.insert(0, ChatMessage::system(agentic_prompt)),
    }

    messages.push(ChatMessage::user(format!(
        "Execute the plan step by step. You are on step 1 of {total_steps}. Step 1: {}\n\n\
         Call the appropriate tool for this step. When you have completed ALL steps and have \
         enough information, provide your final comprehensive answer as text.",
        plan[0]
    )));

    let mut current_step = 0usize;

    // Reserve the last iteration for the forced synthesis call so the
    // turn's total streaming-iteration count stays within the ceiling.
    let react_rounds = max_rounds.saturating_sub(1);

    for round in 0..react_rounds {
        let outcome = orc.stream_once(messages.clone(), model, tools.clone(), None).await?;
        let mut content = outcome.content.clone();
        let mut calls = outcome.tool_calls.clone();

        if calls.is_empty() && !content.is_empty() {
            let active: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();
            let salvaged = salvage_tool_calls(&content, &active);
            if !salvaged.is_empty() {
                calls = salvaged;
                content.clear();
            }
        }

        // No tool calls: the model has synthesized its final answer.
        if calls.is_empty() {
            let step_label = format!("Step {}/{}", (current_step + 1).min(total_steps), total_steps);
            emit(tx, StreamChunk::status(format!("{step_label}: synthesizing final answer"))).await?;
            if !content.is_empty() {
                emit(tx, StreamChunk::content(content.clone())).await?;
            }
            info!(rounds = round + 1, "agentic run completed");
            return orc.persist_assistant(conversation_id, &content, None, &outcome, model);
        }

        messages.push(ChatMessage {
            role: Role::Assistant,
            content: content.clone(),
            tool_calls: Some(calls.clone()),
            tool_call_id: None,
            attachments: None,
        });
        emit(tx, StreamChunk { tool_calls: Some(calls.clone()), ..Default::default() }).await?;

        let step_label = format!("Step {}/{}", (current_step + 1).min(total_steps), total_steps);
        for call in &calls {
            emit(tx, StreamChunk::status(format!("{step_label}: Using {}...", call.name))).await?;
            let result = orc.execute_tool(call).await;
            messages.push(ChatMessage::tool_result(call.id.clone(), result));
        }

        current_step += 1;

        // The model's reasoning may reveal a category we filtered out.
        if let Some(expanded) = expand_tools(orc, &content, &tools).await {
            info!(from = tools.len(), to = expanded.len(), "expanded agentic tool set");
            tools = expanded;
        }

        if current_step < total_steps {
            messages.push(ChatMessage::user(format!(
                "Good. Now proceed to step {} of {total_steps}: {}\n\n\
                 Call the appropriate tool, or if you have enough information to answer \
                 directly, provide your final comprehensive answer.",
                current_step + 1,
                plan[current_step]
            )));
        } else {
            messages.push(ChatMessage::user(
                "All planned steps are complete. Now synthesize ALL the information you \
                 gathered and provide a comprehensive final answer to the original request. \
                 Do NOT call any more tools.",
            ));
        }
    }

    // Ceiling reached with the model still reaching for tools. Force a
    // tool-free synthesis and stream it live.
    emit(tx, StreamChunk::status("Generating final answer...")).await?;
    let outcome = orc.stream_once(messages, model, vec![], Some(tx)).await?;
    orc.persist_assistant(conversation_id, &outcome.content, None, &outcome, model)
}

/// One planner call producing at most six concrete steps.
async fn create_plan(
    orc: &ChatOrchestrator,
    model: &str,
    user_text: &str,
    tool_names: &[String],
    summary: Option<&str>,
) -> Vec<String> {
    let tools_desc = if tool_names.is_empty() { "none".to_string() } else { tool_names.join(", ") };
    let context_note = summary
        .map(|s| format!("\n\nRelevant conversation context:\nPrevious context: {s}\n"))
        .unwrap_or_default();

    let planner_prompt = format!(
        "You are a task planner. Break the user's request into a step-by-step plan.\n\n\
         Rules:\n\
         1. Each step must be ONE concrete action.\n\
         2. Steps should be in logical order - later steps can use results of earlier steps.\n\
         3. Keep steps concise (one line each).\n\
         4. 3-6 steps maximum. Do not over-plan.\n\
         5. The final step should synthesize/summarize the results.\n\
         6. Available tools: {tools_desc}\n\
         {context_note}\n\
         Output a numbered list ONLY, nothing else."
    );

    let request = ChatRequest {
        messages: vec![ChatMessage::system(planner_prompt), ChatMessage::user(user_text)],
        model: model.to_string(),
        temperature: 0.3,
        max_tokens: 300,
        tools: vec![],
    };

    match orc.provider().complete(&request).await {
        Ok(response) => parse_plan(&response.message.content),
        Err(e) => {
            tracing::warn!("planner call failed, using single-step plan: {e}");
            vec![fallback_step()]
        }
    }
}

fn fallback_step() -> String {
    "Analyze the request and provide a comprehensive answer".to_string()
}

/// Parse a numbered plan, stripping `1.` / `2)` style prefixes. Capped at
/// six steps; an empty result degrades to a single analyze step.
pub(crate) fn parse_plan(text: &str) -> Vec<String> {
    let mut steps = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let stripped = line
            .trim_start_matches(|c: char| c.is_ascii_digit())
            .trim_start_matches(['.', ')'])
            .trim();
        if !stripped.is_empty() {
            steps.push(stripped.to_string());
        }
        if steps.len() == 6 {
            break;
        }
    }

    if steps.is_empty() {
        steps.push(fallback_step());
    }
    steps
}

/// When the model's reasoning names a tool category that has no
/// representative in the current set, pull that bucket in (still
/// allowlisted, still capped).
async fn expand_tools(
    orc: &ChatOrchestrator,
    reasoning: &str,
    current: &[ToolSchema],
) -> Option<Vec<ToolSchema>> {
    let text = reasoning.to_lowercase();
    let current_names: HashSet<&str> = current.iter().map(|t| t.name.as_str()).collect();
    let cap = orc.config().tools.agentic_max;

    let mut expanded: Vec<ToolSchema> = current.to_vec();
    for category in orc.registry().categories().await {
        if category == crate::classifier::GENERAL || !text.contains(&category.to_lowercase()) {
            continue;
        }
        let bucket = orc.registry().schemas_in_bucket(&category).await;
        if bucket.is_empty() || bucket.iter().any(|t| current_names.contains(t.name.as_str())) {
            continue;
        }
        for schema in bucket {
            if expanded.len() >= cap {
                break;
            }
            if !expanded.iter().any(|t| t.name == schema.name) {
                expanded.push(schema);
            }
        }
    }

    (expanded.len() > current.len()).then_some(expanded)
}

fn agentic_system_prompt(plan: &[String], tool_names: &[String], max_rounds: usize) -> String {
    let tools_list = if tool_names.is_empty() { "none".to_string() } else { tool_names.join(", ") };
    let plan_text = plan
        .iter()
        .enumerate()
        .map(|(i, step)| format!("  {}. {step}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "--- MULTI-STEP MODE ---\n\
         You are solving a complex task step by step.\n\n\
         YOUR PLAN:\n{plan_text}\n\n\
         RULES:\n\
         1. Execute ONE step at a time. Call the appropriate tool for the current step.\n\
         2. Use ONLY these tools: {tools_list}. Do NOT invent tool names.\n\
         3. After each tool result, evaluate what you learned.\n\
         4. If a step reveals unexpected information, adapt your approach.\n\
         5. When you have enough information to answer, respond with text (no tool call).\n\
         6. Keep each tool call focused - prefer one call per step.\n\
         7. Maximum {max_rounds} rounds allowed."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plan_strips_numbering_styles() {
        let text = "1. Read the error log\n2) Identify the failing module\n3. Suggest a fix";
        assert_eq!(
            parse_plan(text),
            vec!["Read the error log", "Identify the failing module", "Suggest a fix"]
        );
    }

    #[test]
    fn parse_plan_caps_at_six_steps() {
        let text = (1..=9).map(|i| format!("{i}. step {i}")).collect::<Vec<_>>().join("\n");
        assert_eq!(parse_plan(&text).len(), 6);
    }

    #[test]
    fn parse_plan_degrades_to_single_step() {
        assert_eq!(parse_plan("   \n  "), vec![fallback_step()]);
    }

    #[test]
    fn agentic_prompt_lists_plan_and_tools() {
        let prompt = agentic_system_prompt(
            &["Read the log".into(), "Fix the bug".into()],
            &["read_file".into(), "git_diff".into()],
            5,
        );
        assert!(prompt.contains("1. Read the log"));
        assert!(prompt.contains("read_file, git_diff"));
        assert!(prompt.contains("Maximum 5 rounds"));
    }
}
