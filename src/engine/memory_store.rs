use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ChatMessage, ConversationStore};

#[derive(Debug, Default)]
struct Conversation {
    user_id: String,
    messages: Vec<ChatMessage>,
}

/// Process-local conversation history, lost on restart
#[derive(Debug, Clone, Default)]
pub struct InMemoryConversationStore {
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(&self, user_id: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut conversations = self.conversations.write().await;
        conversations.insert(
            id.clone(),
            Conversation {
                user_id: user_id.to_string(),
                messages: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn history(&self, user_id: &str, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let conversations = self.conversations.read().await;
        match conversations.get(conversation_id) {
            Some(conversation) if conversation.user_id == user_id => {
                Ok(conversation.messages.clone())
            }
            // Unknown or foreign conversations start empty
            _ => Ok(Vec::new()),
        }
    }

    async fn append_exchange(
        &self,
        user_id: &str,
        conversation_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation {
                user_id: user_id.to_string(),
                messages: Vec::new(),
            });

        if conversation.user_id != user_id {
            bail!(
                "conversation {} does not belong to user {}",
                conversation_id,
                user_id
            );
        }

        conversation.messages.push(ChatMessage::user(user_text));
        conversation.messages.push(ChatMessage::assistant(assistant_text));
        Ok(())
    }
}
