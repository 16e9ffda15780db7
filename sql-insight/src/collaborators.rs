//! Interfaces of the services this engine hands work to
//!
//! Document ingestion and document storage live outside the engine. These
//! traits describe the calls it makes; [`DocumentUpload::new`] applies the
//! checks every upload must pass before it is handed over.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// File types the ingestion service accepts
pub const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "xlsx", "xls", "csv", "txt", "html", "pptx"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

/// A file on its way to the ingestion service
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    bytes: Vec<u8>,
    filename: String,
    extension: String,
    conversation_id: String,
}

impl DocumentUpload {
    /// Check and wrap an upload
    ///
    /// The filename must be non-empty with an allowed extension and the file
    /// must not be empty.
    pub fn new(
        bytes: Vec<u8>,
        filename: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Result<Self, CollaboratorError> {
        let filename = filename.into();
        if filename.trim().is_empty() {
            return Err(CollaboratorError::InvalidUpload("No file provided".to_string()));
        }

        let extension = filename
            .rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(CollaboratorError::InvalidUpload(format!(
                "File type .{} not supported. Allowed: {}",
                extension,
                ALLOWED_EXTENSIONS
                    .iter()
                    .map(|allowed| format!(".{}", allowed))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        if bytes.is_empty() {
            return Err(CollaboratorError::InvalidUpload("Empty file provided".to_string()));
        }

        Ok(Self {
            bytes,
            filename,
            extension,
            conversation_id: conversation_id.into(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Lowercase extension without the dot
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

/// What the ingestion service reports back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionReceipt {
    pub document_id: String,
    pub indexed_chunks: usize,
    pub processing_time_ms: u64,
}

/// Chunks, embeds and indexes an uploaded document for a conversation
#[async_trait]
pub trait DocumentIngestion: Send + Sync {
    async fn upload_and_index(&self, upload: DocumentUpload) -> Result<IngestionReceipt, CollaboratorError>;
}

/// Conversation document storage
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn remove_document(&self, document_id: &str) -> Result<(), CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryDocuments {
        documents: Mutex<HashMap<String, (String, usize)>>,
    }

    #[async_trait]
    impl DocumentIngestion for InMemoryDocuments {
        async fn upload_and_index(&self, upload: DocumentUpload) -> Result<IngestionReceipt, CollaboratorError> {
            let mut documents = self.documents.lock().unwrap();
            let document_id = format!("doc-{}", documents.len() + 1);
            let chunks = upload.bytes().len().div_ceil(4);
            documents.insert(document_id.clone(), (upload.conversation_id().to_string(), chunks));
            Ok(IngestionReceipt {
                document_id,
                indexed_chunks: chunks,
                processing_time_ms: 0,
            })
        }
    }

    #[async_trait]
    impl DocumentStore for InMemoryDocuments {
        async fn remove_document(&self, document_id: &str) -> Result<(), CollaboratorError> {
            self.documents
                .lock()
                .unwrap()
                .remove(document_id)
                .map(|_| ())
                .ok_or_else(|| CollaboratorError::NotFound(document_id.to_string()))
        }
    }

    #[test]
    fn test_upload_validation() {
        let upload = DocumentUpload::new(b"a,b\n1,2".to_vec(), "Report.CSV", "conv-1").unwrap();
        assert_eq!(upload.extension(), "csv");
        assert_eq!(upload.filename(), "Report.CSV");

        assert!(matches!(
            DocumentUpload::new(b"x".to_vec(), "", "conv-1"),
            Err(CollaboratorError::InvalidUpload(_))
        ));
        assert!(matches!(
            DocumentUpload::new(Vec::new(), "notes.txt", "conv-1"),
            Err(CollaboratorError::InvalidUpload(message)) if message == "Empty file provided"
        ));

        let error = DocumentUpload::new(b"MZ".to_vec(), "setup.exe", "conv-1").unwrap_err();
        assert!(error.to_string().contains("File type .exe not supported"));
        assert!(DocumentUpload::new(b"x".to_vec(), "README", "conv-1").is_err());
    }

    #[tokio::test]
    async fn test_ingest_then_remove() {
        let documents = InMemoryDocuments::default();
        let upload = DocumentUpload::new(b"hello world".to_vec(), "notes.txt", "conv-7").unwrap();

        let receipt = documents.upload_and_index(upload).await.unwrap();
        assert_eq!(receipt.document_id, "doc-1");
        assert_eq!(receipt.indexed_chunks, 3);

        documents.remove_document(&receipt.document_id).await.unwrap();
        assert_eq!(
            documents.remove_document(&receipt.document_id).await,
            Err(CollaboratorError::NotFound("doc-1".to_string()))
        );
    }
}
