//! JSON-RPC framing codec.
//!
//! The wire protocol frames every message as `Content-Length: N\r\n\r\n{json}`
//! over the transport's byte stream. [`FrameReader`] and [`FrameWriter`]
//! provide async reading and writing of framed messages; errors are typed so
//! the transport layer can distinguish a clean shutdown from a protocol
//! violation.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Errors produced while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unexpected EOF while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("frame of {got} bytes exceeds maximum {MAX_FRAME_BYTES}")]
    Oversized { got: usize },
    #[error("malformed JSON-RPC body: {0}")]
    MalformedBody(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads framed JSON-RPC messages from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// EOF inside headers or body, a missing or bogus `Content-Length`,
    /// oversized frames, and invalid JSON are all errors.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(FrameError::Oversized {
                got: content_length,
            });
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof("frame body"),
                _ => FrameError::Io(e),
            })?;

        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Parse headers until the empty separator line.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF before any
    /// header bytes. Header names are matched case-insensitively and
    /// unknown headers (e.g. `Content-Type`) are skipped.
    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                // EOF is a clean shutdown only at a frame boundary. Note
                // that `content_length == None` does not imply "nothing
                // read": EOF after only a Content-Type line is an error.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(FrameError::UnexpectedEof("headers"));
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':')
                && key.eq_ignore_ascii_case("Content-Length")
            {
                content_length = Some(value.trim().parse().map_err(|_| {
                    FrameError::InvalidContentLength(value.trim().to_string())
                })?);
            }
        }

        content_length
            .map(Some)
            .ok_or(FrameError::MissingContentLength)
    }
}

/// Writes framed JSON-RPC messages to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg` and write it with a `Content-Length` header.
    /// The length counts bytes, not characters.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), FrameError> {
        let body = serde_json::to_string(msg)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": { "uri": "file:///test.rs" }
        });

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result, msg);
    }

    #[tokio::test]
    async fn test_multiple_frames() {
        let msg1 = serde_json::json!({"jsonrpc": "2.0", "id": 1});
        let msg2 = serde_json::json!({"jsonrpc": "2.0", "id": 2});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg1).await.unwrap();
        writer.write_frame(&msg2).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg1);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg2);
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let buf: &[u8] = b"";
        let mut reader = FrameReader::new(buf);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_content_length() {
        let buf: &[u8] = b"Content-Type: application/json\r\n\r\n{}";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::MissingContentLength)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_headers_is_error() {
        // EOF after a header line must not look like a clean shutdown.
        let buf: &[u8] = b"Content-Type: application/json\r\n";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::UnexpectedEof("headers"))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Oversized { .. })
        ));
    }

    #[tokio::test]
    async fn test_case_insensitive_content_length() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let frame = format!("content-length: {}\r\n\r\n{body}", body.len());

        let mut reader = FrameReader::new(frame.as_bytes());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result["id"], 1);
    }

    #[tokio::test]
    async fn test_ignores_extra_headers() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len(),
        );

        let mut reader = FrameReader::new(frame.as_bytes());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result["id"], 1);
    }

    #[tokio::test]
    async fn test_eof_mid_body() {
        let buf: &[u8] = b"Content-Length: 100\r\n\r\nhello";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::UnexpectedEof("frame body"))
        ));
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let body = b"not valid json!!!";
        let frame = format!("Content-Length: {}\r\n\r\n", body.len());
        let mut buf = frame.into_bytes();
        buf.extend_from_slice(body);

        let mut reader = FrameReader::new(buf.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::MalformedBody(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_content_length_value() {
        let buf: &[u8] = b"Content-Length: not_a_number\r\n\r\n";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::InvalidContentLength(_))
        ));
    }

    #[tokio::test]
    async fn test_content_length_counts_bytes_not_chars() {
        // "é" is 2 bytes in UTF-8, so {"k":"é"} is 10 bytes.
        let body = r#"{"k":"é"}"#;
        assert_eq!(body.len(), 10);
        let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());

        let mut reader = FrameReader::new(frame.as_bytes());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result["k"], "é");
    }

    #[tokio::test]
    async fn test_write_content_length_is_byte_count() {
        let msg = serde_json::json!({"k": "é"});
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg).await.unwrap();

        let output = String::from_utf8(buf).unwrap();
        let body = serde_json::to_string(&msg).unwrap();
        assert!(output.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));
    }
}
