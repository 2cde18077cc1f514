//! Content-Length message framing for the compiler protocol.
//!
//! HTTP-style framing, the same protocol used by the Language Server
//! Protocol. Gives reliable message boundaries over stream-oriented
//! sockets; both the TCP and Unix-domain variants share it.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header parsing is case-insensitive and handles both CRLF and LF line
//! endings.

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (100MB) to prevent OOM from a buggy peer.
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Read a Content-Length framed message from the stream.
///
/// # Errors
///
/// Returns an error if:
/// - The stream is closed (EOF)
/// - No Content-Length header is found
/// - Content-Length exceeds MAX_MESSAGE_SIZE (100MB)
/// - The body cannot be read completely
/// - The body is not valid UTF-8
pub async fn read_message<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    // Read headers until blank line
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("Failed to read header line")?;

        // EOF - connection closed
        if bytes_read == 0 {
            return Err(anyhow!("Connection closed by peer"));
        }

        // Trim both CRLF and LF line endings
        let trimmed = line.trim();

        // Empty line signals end of headers
        if trimmed.is_empty() {
            break;
        }

        // Parse Content-Length header (case-insensitive per HTTP spec)
        if let Some(colon_pos) = trimmed.find(':') {
            let key = trimmed[..colon_pos].trim();
            let value = trimmed[colon_pos + 1..].trim();

            if key.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid Content-Length value: {}", value))?,
                );
            }
            // Ignore other headers
        }
    }

    // Validate Content-Length was present
    let size = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;

    // Validate size is within bounds
    if size > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "Message size {} exceeds maximum {} bytes",
            size,
            MAX_MESSAGE_SIZE
        ));
    }

    // Read message body
    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read message body")?;

    // Convert to UTF-8
    String::from_utf8(body).context("Message body is not valid UTF-8")
}

/// Write a Content-Length framed message to the stream.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub async fn write_message<W>(writer: &mut W, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_bytes = body.as_bytes();
    let header = format!("Content-Length: {}\r\n\r\n", body_bytes.len());

    writer
        .write_all(header.as_bytes())
        .await
        .context("Failed to write message header")?;

    writer
        .write_all(body_bytes)
        .await
        .context("Failed to write message body")?;

    writer.flush().await.context("Failed to flush message")?;

    Ok(())
}
