use crate::context::{ChatMessage, Conversation, ConversationTurn, Role};
use crate::database::{missing_index, EmbeddingRecord, RetrievalResult, VectorStore};
use crate::document::{extract_pages, PageChunk};
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Number of pages handed to the model as context
pub const TOP_K: usize = 4;

const SYSTEM_PREAMBLE: &str = "The following is a friendly conversation between a human and an AI. \
The AI is talkative and provides lots of specific details from its context. \
If the AI does not know the answer to a question, it truthfully says it does not know.";

/// A hosted chat-completion model
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send the full message list and return the model's reply
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Summary of a finished index build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildReport {
    pub pages: usize,
    pub dimensions: usize,
}

/// Result of answering one question
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub question: String,
    pub answer: String,
    pub history: Vec<ConversationTurn>,
}

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagEngine {
    document_path: PathBuf,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
    // Builds take the write half, retrievals the read half
    index_lock: RwLock<()>,
}

impl RagEngine {
    /// Create a new RAG engine
    pub fn new(
        document_path: impl Into<PathBuf>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
    ) -> Self {
        RagEngine {
            document_path: document_path.into(),
            store,
            embedder,
            chat,
            index_lock: RwLock::new(()),
        }
    }

    /// Check whether an index has been built
    pub async fn index_exists(&self) -> Result<bool> {
        let _guard = self.index_lock.read().await;
        self.store.exists().await
    }

    /// Extract the source document, embed every page and replace the index
    pub async fn build_index(&self) -> Result<BuildReport> {
        let _guard = self.index_lock.write().await;

        let path = self.document_path.clone();
        let pages: Vec<PageChunk> = tokio::task::spawn_blocking(move || extract_pages(path))
            .await
            .map_err(|e| RagError::Parse(format!("PDF extraction aborted: {}", e)))??;
        info!("Split into {} pages", pages.len());

        let texts: Vec<String> = pages.iter().map(|page| page.text.clone()).collect();
        info!("Generating embeddings with {}...", self.embedder.model());
        let embeddings = self.embedder.embed(&texts).await?;

        if embeddings.len() != pages.len() {
            return Err(RagError::Provider(format!(
                "Expected {} embeddings, got {}",
                pages.len(),
                embeddings.len()
            )));
        }

        let dimensions = embeddings.first().map(|e| e.dimensions()).unwrap_or_default();
        let records: Vec<EmbeddingRecord> = pages
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(id, (page, embedding))| EmbeddingRecord {
                id,
                text: page.text,
                page: page.page,
                embedding,
            })
            .collect();
        let report = BuildReport {
            pages: records.len(),
            dimensions,
        };

        self.store.rebuild(records).await?;
        info!(
            "Indexed {} pages ({} dimensions) at {}",
            report.pages,
            report.dimensions,
            self.store.location()
        );

        Ok(report)
    }

    /// Return the pages most similar to `query`
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievalResult>> {
        let _guard = self.index_lock.read().await;

        // Fail before spending an embedding call when nothing was built
        if !self.store.exists().await? {
            return Err(missing_index(&self.store.location()));
        }

        let query_embedding = self.embedder.embed_query(query).await?;
        let results = self.store.search(&query_embedding, TOP_K).await?;
        debug!(
            "Retrieved pages {:?}",
            results.iter().map(|r| r.page).collect::<Vec<_>>()
        );

        Ok(results)
    }

    /// Retrieve context for `question` and answer it within `conversation`
    pub async fn ask(&self, conversation: &Mutex<Conversation>, question: &str) -> Result<Answer> {
        if question.trim().is_empty() {
            return Err(RagError::InvalidRequest(
                "question must not be empty".to_string(),
            ));
        }

        let results = self.retrieve(question).await?;
        let context_text = format_context(&results);

        let (answer, history) = self.answer(conversation, &context_text, question).await?;

        Ok(Answer {
            question: question.to_string(),
            answer,
            history,
        })
    }

    /// Fill the prompt template, send it along with the conversation so far,
    /// and record the exchange on success
    pub async fn answer(
        &self,
        conversation: &Mutex<Conversation>,
        context_text: &str,
        question: &str,
    ) -> Result<(String, Vec<ConversationTurn>)> {
        let prompt = build_prompt(context_text, question);

        // Held across the model call so exchanges of one session never interleave
        let mut conversation = conversation.lock().await;

        let mut messages = Vec::with_capacity(conversation.len() + 2);
        messages.push(ChatMessage::new(Role::System, SYSTEM_PREAMBLE));
        messages.extend(conversation.messages().cloned());
        messages.push(ChatMessage::new(Role::User, prompt.clone()));

        let answer = self.chat.complete(&messages).await?;
        conversation.push_exchange(prompt, answer.clone());

        Ok((answer, conversation.history()))
    }
}

/// Join retrieved pages into the context block of the prompt
pub fn format_context(results: &[RetrievalResult]) -> String {
    results
        .iter()
        .map(|result| result.text.as_str())
        .collect::<Vec<&str>>()
        .join("\n\n")
}

/// Fill the instruction template with the retrieved context and the question
pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "You are an expert in the Caixa Econômica Federal Ethics Code, with comprehensive knowledge of organizational ethical guidelines, conduct standards, and reporting mechanisms.
Don't make up information and, if you don't know it, say so explicitly and recommend talking with HR.

**Retrieval:**
Relevant information from the Caixa Econômica Federal Ethics Code, including:
{context}

**Instruction:**
Answer in a clear, precise, and professional manner, adapting the tone to the employee's role and context.
Your answer should help resolve the ethical query without unnecessary complications or legal jargon.
Answer only from the retrieved information above.

**Context:**
The question has been asked by a Caixa Econômica Federal employee seeking clarification on ethical guidelines, conduct expectations, or potential ethical dilemmas in the workplace.

**Explanation:**
Provide detailed explanations based on the Ethics Code, citing specific sections or articles when relevant.
Help the employee understand the ethical principles and reasoning behind the guidance.
If the context provides official references or contact information for the Ethics Committee, include them.

**Attention:**
Always answer in Portuguese.
Maintain confidentiality and professionalism in all interactions.

Question: {question}
",
        context = context,
        question = question
    )
}
