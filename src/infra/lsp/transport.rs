//! LSP Transport Layer
//!
//! Handles LSP message framing with Content-Length headers:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! {"jsonrpc":"2.0",...}
//! ```
//!
//! The reader is generic over the byte stream so framing survives messages
//! split across reads and multiple messages per read; a missing or malformed
//! header, or a body cut short by EOF, is a framing failure the owning client
//! treats as a stream failure.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::protocol::{Message, Notification, Request, Response};

/// LSP Transport for reading framed messages off a server's stdout
pub struct Transport<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> Transport<R> {
    pub fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Read the next message from the stream
    pub async fn read_message(&mut self) -> io::Result<Message> {
        let content_length = self.read_headers().await?;

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        let json =
            String::from_utf8(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tracing::trace!("LSP <- {}", json);

        Message::parse(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Read headers and return Content-Length
    async fn read_headers(&mut self) -> io::Result<usize> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Server closed connection",
                ));
            }

            let line = line.trim();

            // Empty line marks end of headers
            if line.is_empty() {
                break;
            }

            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                );
            }
            // Ignore other headers (Content-Type, etc.)
        }

        content_length
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Missing Content-Length"))
    }
}

/// Write an LSP request with framing
pub async fn write_request<W: AsyncWrite + Unpin>(
    sink: &mut W,
    request: &Request,
) -> io::Result<()> {
    let json = serde_json::to_string(request)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    write_message(sink, &json).await
}

/// Write an LSP notification with framing
pub async fn write_notification<W: AsyncWrite + Unpin>(
    sink: &mut W,
    notification: &Notification,
) -> io::Result<()> {
    let json = serde_json::to_string(notification)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    write_message(sink, &json).await
}

/// Write an LSP response (for server-initiated requests)
pub async fn write_response<W: AsyncWrite + Unpin>(
    sink: &mut W,
    response: &Response,
) -> io::Result<()> {
    let json = serde_json::to_string(response)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    write_message(sink, &json).await
}

/// Frame and write a raw JSON payload
async fn write_message<W: AsyncWrite + Unpin>(sink: &mut W, json: &str) -> io::Result<()> {
    tracing::trace!("LSP -> {}", json);

    let message = format!("Content-Length: {}\r\n\r\n{}", json.len(), json);
    sink.write_all(message.as_bytes()).await?;
    sink.flush().await
}

/// Frame a JSON payload without writing it (used by tests and the mock server)
pub fn frame(json: &str) -> String {
    format!("Content-Length: {}\r\n\r\n{}", json.len(), json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Yields the underlying bytes at most `chunk` at a time, forcing the
    /// framer to reassemble messages across reads.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl AsyncRead for ChunkedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos >= self.data.len() {
                return Poll::Ready(Ok(()));
            }
            let end = (self.pos + self.chunk).min(self.data.len());
            buf.put_slice(&self.data[self.pos..end]);
            self.pos = end;
            Poll::Ready(Ok(()))
        }
    }

    fn request_json(id: u64, method: &str) -> String {
        serde_json::to_string(&Request::new(id, method, None)).unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_single_message() {
        let json = request_json(1, "initialize");
        let wire = frame(&json).into_bytes();

        let mut transport = Transport::new(ChunkedReader {
            data: wire,
            pos: 0,
            chunk: usize::MAX,
        });

        let message = transport.read_message().await.unwrap();
        match message {
            Message::Request(req) => assert_eq!(req.method, "initialize"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_survives_byte_level_chunking() {
        let json = request_json(7, "textDocument/definition");
        let wire = frame(&json).into_bytes();

        for chunk in [1, 2, 3, 5, 17] {
            let mut transport = Transport::new(ChunkedReader {
                data: wire.clone(),
                pos: 0,
                chunk,
            });
            let message = transport.read_message().await.unwrap();
            match message {
                Message::Request(req) => {
                    assert_eq!(req.method, "textDocument/definition");
                    assert_eq!(serde_json::to_string(&req).unwrap(), json);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_multiple_messages_in_one_read() {
        let first = frame(&request_json(1, "one"));
        let second = frame(&request_json(2, "two"));
        let wire = format!("{}{}", first, second).into_bytes();

        let mut transport = Transport::new(ChunkedReader {
            data: wire,
            pos: 0,
            chunk: usize::MAX,
        });

        for expected in ["one", "two"] {
            match transport.read_message().await.unwrap() {
                Message::Request(req) => assert_eq!(req.method, expected),
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_missing_content_length_is_framing_error() {
        let wire = b"Content-Type: application/json\r\n\r\n{}".to_vec();
        let mut transport = Transport::new(ChunkedReader {
            data: wire,
            pos: 0,
            chunk: usize::MAX,
        });

        let err = transport.read_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_malformed_content_length_is_framing_error() {
        let wire = b"Content-Length: banana\r\n\r\n{}".to_vec();
        let mut transport = Transport::new(ChunkedReader {
            data: wire,
            pos: 0,
            chunk: usize::MAX,
        });

        let err = transport.read_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_body_is_framing_error() {
        let wire = b"Content-Length: 100\r\n\r\n{\"jsonrpc\":\"2.0\"}".to_vec();
        let mut transport = Transport::new(ChunkedReader {
            data: wire,
            pos: 0,
            chunk: 4,
        });

        let err = transport.read_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let request = Request::new(3, "shutdown", None);
        let mut wire = Vec::new();
        write_request(&mut wire, &request).await.unwrap();

        let mut transport = Transport::new(ChunkedReader {
            data: wire,
            pos: 0,
            chunk: 2,
        });
        match transport.read_message().await.unwrap() {
            Message::Request(req) => assert_eq!(req.method, "shutdown"),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
