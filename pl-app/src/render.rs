//! HTML rendering for the web transcript.
//!
//! Model text goes through a markdown renderer; everything mechanical
//! (plans, tool payloads, prompts) is escaped and wrapped by hand so the
//! stored `content` column is always safe to inject into the page.

use crate::agent::plan::PlanStep;
use crate::store::{ChatRecord, MessageRecord};
use pulldown_cmark::{html, Options, Parser};

pub fn markdown_to_html(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    let parser = Parser::new_ext(text, options);
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

/// A chat reply is rendered markdown plus a footer naming the model that
/// produced it.
pub fn chat_reply_html(text: &str, model: &str) -> String {
    let mut out = markdown_to_html(text);
    out.push_str(&format!(
        "\n<div class=\"msg-meta\">(Model: {})</div>",
        escape_html(model)
    ));
    out
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

/// Numbered plan view shown for approval. Tool names and reasoning come
/// straight from the model, so both are escaped.
pub fn plan_html(steps: &[PlanStep]) -> String {
    let mut out = String::from("<h3>Agent Plan</h3>\n<ol>\n");
    for step in steps {
        out.push_str(&format!(
            "  <li><strong>{}</strong>: {}</li>\n",
            escape_html(&step.tool),
            escape_html(&step.reasoning)
        ));
    }
    out.push_str("</ol>");
    out
}

pub fn json_block_html(value: &serde_json::Value) -> String {
    let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    format!("<pre>{}</pre>", escape_html(&pretty))
}

/// Plain-text transcript for download. Built from `raw_content` so it
/// contains what the model actually saw, not the rendered HTML.
pub fn transcript_text(chat: &ChatRecord, messages: &[MessageRecord]) -> String {
    let mut out = format!(
        "Chat: {}\nModel: {}\nCreated: {}\n\n",
        chat.title,
        chat.model,
        chat.created_at.to_rfc3339()
    );
    for msg in messages {
        let who = match msg.role {
            pl_llm::Role::User => "You",
            pl_llm::Role::Model => "Model",
        };
        out.push_str(&format!("--- {} ({}) ---\n", who, msg.kind.as_str()));
        out.push_str(&msg.raw_content);
        out.push_str("\n\n");
    }
    out
}
