//! System prompt construction
//!
//! The assistant speaks in first person about one person's professional
//! background, grounded strictly in the retrieved context passages.

/// Prompt for voice turns. Responses must stay short and speakable — they are
/// piped straight into speech synthesis.
const VOICE_PROMPT: &str = "You are a voice assistant answering questions about my professional \
background on my behalf. Speak in first person, as if in a phone call. Keep answers to one to \
three sentences unless asked for detail. Ground every claim in the background information below; \
if it does not cover the question, say so briefly rather than guessing. Do not use markdown, \
bullet points, or code blocks - your responses will be spoken aloud.";

/// Prompt for text chat. Same grounding rules, room for longer answers.
const CHAT_PROMPT: &str = "You are an assistant answering questions about my professional \
background on my behalf. Speak in first person. Ground every claim in the background information \
below; if it does not cover the question, say so rather than guessing. Answer clearly and \
concisely.";

fn render(prompt: &str, context: &str, chat_history: &str) -> String {
    let mut rendered = String::from(prompt);
    if !context.is_empty() {
        rendered.push_str("\n\nBackground information:\n");
        rendered.push_str(context);
    }
    if !chat_history.is_empty() {
        rendered.push_str("\n\nConversation so far:\n");
        rendered.push_str(chat_history);
    }
    rendered
}

/// System prompt for a voice turn
pub fn voice_system_prompt(context: &str, chat_history: &str) -> String {
    render(VOICE_PROMPT, context, chat_history)
}

/// System prompt for a text-chat turn
pub fn chat_system_prompt(context: &str, chat_history: &str) -> String {
    render(CHAT_PROMPT, context, chat_history)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_only_when_present() {
        let bare = voice_system_prompt("", "");
        assert!(!bare.contains("Background information"));
        assert!(!bare.contains("Conversation so far"));

        let full = voice_system_prompt("[1] From cv.md:\nfacts", "User: hi");
        assert!(full.contains("Background information:\n[1] From cv.md:\nfacts"));
        assert!(full.contains("Conversation so far:\nUser: hi"));
    }
}
