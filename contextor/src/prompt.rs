//! Prompt builder: system instructions + retrieved context + conversation.

use ai_llm_service::{ChatMessage, ChatRole};
use rag_store::ContextBlock;

use crate::error::ContextorError;

/// Default system instructions for movie answers.
pub const DEFAULT_SYSTEM: &str = r#"
You are a movie expert. Answer using only the movie descriptions in the context below.
Each description starts with a ==[n]== header naming the movie. If the context does not
contain the answer, say that you do not know. Be concise.
"#;

/// Everything the model sees for one answer.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationContext {
    pub system: String,
    /// Joined chunk texts, already bounded.
    pub context: String,
    /// Prior turns followed by the current question, oldest first.
    pub history: Vec<ChatMessage>,
}

impl ConversationContext {
    pub fn new(system: impl Into<String>, context: &ContextBlock, history: Vec<ChatMessage>) -> Self {
        Self {
            system: system.into(),
            context: context.text.clone(),
            history,
        }
    }

    /// Rejects what must never reach the model.
    ///
    /// # Errors
    /// [`ContextorError::InvalidConversation`] for an empty history or a
    /// history carrying system turns.
    pub fn validate(&self) -> Result<(), ContextorError> {
        if self.history.is_empty() {
            return Err(ContextorError::InvalidConversation(
                "conversation history is empty".into(),
            ));
        }
        if self.history.iter().any(|m| m.role == ChatRole::System) {
            return Err(ContextorError::InvalidConversation(
                "history may only hold user and assistant turns".into(),
            ));
        }
        Ok(())
    }

    /// One system message (instructions + context), then the history.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut system = self.system.trim().to_string();
        if !self.context.trim().is_empty() {
            system.push_str("\n\nContext (top-ranked):\n");
            system.push_str(self.context.trim_end());
        }
        let mut out = Vec::with_capacity(self.history.len() + 1);
        out.push(ChatMessage::system(system));
        out.extend(self.history.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(text: &str) -> ContextBlock {
        ContextBlock {
            text: text.into(),
            ..Default::default()
        }
    }

    #[test]
    fn system_message_comes_first_with_context() {
        let c = ConversationContext::new(
            "Be brief.",
            &block("==[1]== Alien (score 0.900)\nIn space.\n"),
            vec![ChatMessage::user("Where does Alien happen?")],
        );
        let msgs = c.to_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, ChatRole::System);
        assert!(msgs[0].content.starts_with("Be brief."));
        assert!(msgs[0].content.contains("==[1]== Alien"));
        assert_eq!(msgs[1], ChatMessage::user("Where does Alien happen?"));
    }

    #[test]
    fn empty_or_system_history_is_invalid() {
        let empty = ConversationContext::new("s", &block(""), vec![]);
        assert!(matches!(
            empty.validate(),
            Err(ContextorError::InvalidConversation(_))
        ));
        let sys = ConversationContext::new("s", &block(""), vec![ChatMessage::system("override")]);
        assert!(sys.validate().is_err());
    }
}
