pub mod context;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod openai;
pub mod rag;
pub mod server;

/// Source document indexed by `/create_vector_db`
pub const DOC_PATH: &str = "data/Codigo-de-Etica-e-de-Conduta.pdf";

/// Storage location of the vector index
pub const VECTOR_STORE_PATH: &str = "db";

#[cfg(test)]
pub(crate) mod test_support {
    use crate::context::ChatMessage;
    use crate::embeddings::{Embedder, Embedding};
    use crate::error::{RagError, Result};
    use crate::rag::ChatModel;
    use async_trait::async_trait;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};
    use std::path::Path;
    use tokio::sync::Mutex;

    const DIMENSIONS: usize = 32;

    /// Deterministic bag-of-words embedder
    pub struct HashEmbedder;

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn model(&self) -> &str {
            "hash-bow"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut values = vec![0.0; DIMENSIONS];
                    for word in text.split_whitespace() {
                        let mut hash: u32 = 2166136261;
                        for byte in word.to_lowercase().bytes() {
                            hash ^= byte as u32;
                            hash = hash.wrapping_mul(16777619);
                        }
                        values[hash as usize % DIMENSIONS] += 1.0;
                    }
                    Embedding { values }
                })
                .collect())
        }
    }

    /// Chat model that records every request and answers with a counter
    #[derive(Default)]
    pub struct RecordingChat {
        pub calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl ChatModel for RecordingChat {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            let mut calls = self.calls.lock().await;
            calls.push(messages.to_vec());
            Ok(format!("Resposta {}", calls.len()))
        }
    }

    pub struct FailingChat;

    #[async_trait]
    impl ChatModel for FailingChat {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            Err(RagError::Provider("upstream timeout".to_string()))
        }
    }

    /// Write a PDF with one line of Courier text per page
    pub fn write_pdf(path: &Path, pages: &[&str]) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 18.into()]),
                    Operation::new("Td", vec![72.into(), 700.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            });
            kids.push(page_id.into());
        }

        let pages_dict = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages.len() as i64,
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages_dict));

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }
}
