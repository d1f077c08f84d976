//! Response content variants.

use std::path::PathBuf;
use std::pin::Pin;

use tokio::io::AsyncRead;

/// Reader handed to streaming content.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Body attached to a response. Attaching a new one replaces the previous.
pub enum Content {
    /// Plain text body.
    Message(String),

    /// JSON-encoded body.
    Structured(serde_json::Value),

    /// File streamed from disk (range and conditional requests honoured).
    File(PathBuf),

    /// Byte stream with declared length and content type.
    Stream {
        reader: BoxReader,
        length: Option<u64>,
        content_type: Option<String>,
    },

    /// Raw bytes copied as-is. Without a length the reader is copied to EOF.
    Buffer {
        reader: BoxReader,
        length: Option<u64>,
    },
}

impl Content {
    pub fn kind(&self) -> &'static str {
        match self {
            Content::Message(_) => "message",
            Content::Structured(_) => "structured",
            Content::File(_) => "file",
            Content::Stream { .. } => "stream",
            Content::Buffer { .. } => "buffer",
        }
    }
}

impl std::fmt::Debug for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Content::Message(m) => f.debug_tuple("Message").field(m).finish(),
            Content::Structured(v) => f.debug_tuple("Structured").field(v).finish(),
            Content::File(p) => f.debug_tuple("File").field(p).finish(),
            Content::Stream {
                length,
                content_type,
                ..
            } => f
                .debug_struct("Stream")
                .field("length", length)
                .field("content_type", content_type)
                .finish(),
            Content::Buffer { length, .. } => {
                f.debug_struct("Buffer").field("length", length).finish()
            }
        }
    }
}
