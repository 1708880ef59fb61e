use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Delimiter preceding the user's question inside a filled prompt
pub const QUESTION_DELIMITER: &str = "Question:";

/// Session used when a request does not name one
pub const DEFAULT_SESSION: &str = "default";

/// Default number of turns kept per session
pub const DEFAULT_MAX_TURNS: usize = 50;

/// Default number of sessions kept at once
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One raw message exchanged with the chat model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }
}

/// One question/answer exchange as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub human: String,
    pub ia: String,
}

/// Message memory of a single session.
///
/// Holds the raw prompts and replies in chronological order. Once `max_turns`
/// exchanges are stored, the oldest exchange is dropped for each new one.
#[derive(Debug)]
pub struct Conversation {
    messages: VecDeque<ChatMessage>,
    max_turns: usize,
}

impl Conversation {
    pub fn new(max_turns: usize) -> Self {
        Conversation {
            messages: VecDeque::new(),
            max_turns: max_turns.max(1),
        }
    }

    /// Raw messages in chronological order
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Record a prompt and the model's reply
    pub fn push_exchange(&mut self, prompt: impl Into<String>, reply: impl Into<String>) {
        while self.messages.len() / 2 >= self.max_turns {
            self.messages.pop_front();
            self.messages.pop_front();
        }
        self.messages.push_back(ChatMessage::new(Role::User, prompt));
        self.messages.push_back(ChatMessage::new(Role::Assistant, reply));
    }

    /// Move every exchange of `other` to the end of this conversation
    pub fn append(&mut self, other: &mut Conversation) {
        while let (Some(prompt), Some(reply)) = (other.messages.pop_front(), other.messages.pop_front()) {
            self.push_exchange(prompt.content, reply.content);
        }
    }

    /// History as question/answer pairs
    pub fn history(&self) -> Vec<ConversationTurn> {
        let messages: Vec<&ChatMessage> = self.messages.iter().collect();
        format_chat_history(&messages)
    }
}

/// Pair consecutive messages into turns, keeping only the question part of each prompt
pub fn format_chat_history(messages: &[&ChatMessage]) -> Vec<ConversationTurn> {
    messages
        .chunks(2)
        .map(|pair| ConversationTurn {
            human: extract_question(&pair[0].content),
            ia: pair.get(1).map(|m| m.content.clone()).unwrap_or_default(),
        })
        .collect()
}

/// Extract the question from a filled prompt.
///
/// The question is the remainder of the last line that starts with the
/// delimiter; text without a delimiter is returned whole.
pub fn extract_question(text: &str) -> String {
    let start = match text.rfind(&format!("\n{}", QUESTION_DELIMITER)) {
        Some(idx) => Some(idx + 1),
        None if text.starts_with(QUESTION_DELIMITER) => Some(0),
        None => None,
    };

    match start {
        Some(idx) => {
            let rest = &text[idx + QUESTION_DELIMITER.len()..];
            rest.lines().next().unwrap_or_default().trim().to_string()
        }
        None => text.trim().to_string(),
    }
}

struct SessionEntry {
    conversation: Arc<Mutex<Conversation>>,
    last_used: u64,
}

#[derive(Default)]
struct Sessions {
    entries: HashMap<String, SessionEntry>,
    clock: u64,
}

impl Sessions {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drop least recently used sessions until at most `max` remain
    fn evict_beyond(&mut self, max: usize) {
        while self.entries.len() > max {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                    debug!("Evicted session {}", id);
                }
                None => break,
            }
        }
    }
}

/// Conversations keyed by session id.
///
/// A session is only stored once a question in it has been answered, and at
/// most `max_sessions` are kept; the least recently used one is evicted first.
pub struct ConversationStore {
    sessions: Mutex<Sessions>,
    max_turns: usize,
    max_sessions: usize,
}

impl ConversationStore {
    pub fn new(max_turns: usize, max_sessions: usize) -> Self {
        ConversationStore {
            sessions: Mutex::new(Sessions::default()),
            max_turns,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Conversation stored for `session_id`, or a fresh one that is not stored
    /// until passed to [`ConversationStore::commit`]
    pub async fn session(&self, session_id: &str) -> Arc<Mutex<Conversation>> {
        let mut sessions = self.sessions.lock().await;
        let now = sessions.tick();
        match sessions.entries.get_mut(session_id) {
            Some(entry) => {
                entry.last_used = now;
                entry.conversation.clone()
            }
            None => Arc::new(Mutex::new(Conversation::new(self.max_turns))),
        }
    }

    /// Keep `conversation` as the session's memory after a successful exchange
    pub async fn commit(&self, session_id: &str, conversation: &Arc<Mutex<Conversation>>) {
        let stored = {
            let mut sessions = self.sessions.lock().await;
            let now = sessions.tick();
            match sessions.entries.get_mut(session_id) {
                Some(entry) => {
                    entry.last_used = now;
                    entry.conversation.clone()
                }
                None => {
                    sessions.entries.insert(
                        session_id.to_string(),
                        SessionEntry {
                            conversation: conversation.clone(),
                            last_used: now,
                        },
                    );
                    sessions.evict_beyond(self.max_sessions);
                    debug!("Started session {} ({} held)", session_id, sessions.entries.len());
                    return;
                }
            }
        };

        // Another request started the same session meanwhile
        if !Arc::ptr_eq(&stored, conversation) {
            let mut detached = conversation.lock().await;
            stored.lock().await.append(&mut detached);
        }
    }

    #[cfg(test)]
    pub(crate) async fn session_count(&self) -> usize {
        self.sessions.lock().await.entries.len()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        ConversationStore::new(DEFAULT_MAX_TURNS, DEFAULT_MAX_SESSIONS)
    }
}
