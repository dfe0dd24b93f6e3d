//! Prompt construction for the agent pipeline.

/// Decide whether a prompt is conversational or an actionable task.
/// The model must answer with exactly one word.
pub fn classifier_prompt(goal: &str) -> String {
    format!(
        "You are a router for an assistant that can either chat or operate tools.\n\
         Classify the user's message below.\n\
         Respond with exactly one word and nothing else:\n\
         - CHAT if it is conversation, a question, or a request for explanation.\n\
         - TASK if it asks for actions on files, directories, commands, or code execution.\n\n\
         User message:\n{goal}"
    )
}

/// Ask for a step-by-step tool plan as a single JSON document.
pub fn planner_prompt(goal: &str, manifest_json: &str) -> String {
    format!(
        "You are a planning agent. Break the user's goal into a sequence of tool calls.\n\
         \n\
         Available tools:\n{manifest_json}\n\
         \n\
         Respond with ONLY a JSON object, no prose and no markdown, of this exact shape:\n\
         {{\"plan\": [{{\"step\": 1, \"tool\": \"<tool name>\", \"parameters\": {{...}}, \
         \"reasoning\": \"<one sentence>\"}}]}}\n\
         \n\
         Rules:\n\
         - Use only tools from the list above, with their declared parameters.\n\
         - Keep the plan as short as the goal allows.\n\
         - Paths are relative to the sandbox root.\n\
         \n\
         User goal:\n{goal}"
    )
}

/// Final answer after every step has run. The tool transcript is already
/// in the conversation history.
pub fn synthesis_prompt(goal: &str) -> String {
    format!(
        "All plan steps have finished; their outputs are in the conversation above.\n\
         Write the final answer to the user's original goal. Summarize what was done and \
         what was found in plain language. Do not dump raw JSON.\n\n\
         Original goal:\n{goal}"
    )
}

/// Short title for a fresh chat, generated from its first message.
pub fn title_prompt(first_message: &str) -> String {
    format!(
        "Write a title of 3 to 5 words for a conversation that starts with the message \
         below. Respond with the title only, no quotes, no punctuation at the end.\n\n{first_message}"
    )
}
