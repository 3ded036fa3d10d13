//! Length-prefixed framing over an async byte stream.
//!
//! Wire format per frame: `<decimal-length>\r\n<payload>\r\n`, where
//! `payload` is a JSON-serialised `Request` or `Response`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::ProtocolError;

use super::message::{Request, Response};

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads length-prefixed frames off an `AsyncRead` and deserialises
/// them into `Request`/`Response` values.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Read one `<len>\r\n<payload>\r\n` frame and return its raw bytes.
    async fn read_frame(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut len_buf = Vec::with_capacity(16);
        loop {
            let b = self.inner.read_u8().await.map_err(ProtocolError::Io)?;
            if b == b'\r' {
                let nl = self.inner.read_u8().await.map_err(ProtocolError::Io)?;
                if nl != b'\n' {
                    return Err(ProtocolError::BadTerminator);
                }
                break;
            }
            if !b.is_ascii_digit() {
                return Err(ProtocolError::BadLength(format!(
                    "non-digit byte {:#x} in length prefix",
                    b
                )));
            }
            len_buf.push(b);
        }

        let len_str = std::str::from_utf8(&len_buf)
            .map_err(|e| ProtocolError::BadLength(e.to_string()))?;
        let len: usize = len_str
            .parse()
            .map_err(|_| ProtocolError::BadLength(len_str.to_string()))?;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::BadLength(format!(
                "{} exceeds max frame length {}",
                len, MAX_FRAME_LEN
            )));
        }

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(ProtocolError::Io)?;

        let mut terminator = [0u8; 2];
        self.inner
            .read_exact(&mut terminator)
            .await
            .map_err(ProtocolError::Io)?;
        if &terminator != b"\r\n" {
            return Err(ProtocolError::BadTerminator);
        }

        Ok(payload)
    }

    pub async fn read_request(&mut self) -> Result<Request, ProtocolError> {
        let payload = self.read_frame().await?;
        serde_json::from_slice(&payload).map_err(ProtocolError::Decode)
    }

    pub async fn read_response(&mut self) -> Result<Response, ProtocolError> {
        let payload = self.read_frame().await?;
        serde_json::from_slice(&payload).map_err(ProtocolError::Decode)
    }
}

/// Writes length-prefixed frames to an `AsyncWrite`.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let header = format!("{}\r\n", payload.len());
        self.inner
            .write_all(header.as_bytes())
            .await
            .map_err(ProtocolError::Io)?;
        self.inner.write_all(payload).await.map_err(ProtocolError::Io)?;
        self.inner
            .write_all(b"\r\n")
            .await
            .map_err(ProtocolError::Io)?;
        self.inner.flush().await.map_err(ProtocolError::Io)?;
        Ok(())
    }

    pub async fn write_request(&mut self, req: &Request) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(req).map_err(ProtocolError::Decode)?;
        self.write_frame(&payload).await
    }

    pub async fn write_response(&mut self, resp: &Response) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(resp).map_err(ProtocolError::Decode)?;
        self.write_frame(&payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::message::{CreateRequest, CreateResponse, EchoRequest};
    use super::*;

    #[tokio::test]
    async fn round_trips_a_request_over_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, mut client_w) = tokio::io::split(client);
        let (server_r, _server_w) = tokio::io::split(server);

        let mut writer = FrameWriter::new(&mut client_w);
        let req = Request::Echo(EchoRequest {
            message: "hello".to_string(),
        });
        writer.write_request(&req).await.unwrap();

        let mut reader = FrameReader::new(server_r);
        let decoded = reader.read_request().await.unwrap();
        match decoded {
            Request::Echo(e) => assert_eq!(e.message, "hello"),
            other => panic!("unexpected variant: {:?}", other),
        }

        drop(client_r);
    }

    #[tokio::test]
    async fn round_trips_a_response_and_preserves_tag() {
        let (client, server) = tokio::io::duplex(4096);
        let (_client_r, mut client_w) = tokio::io::split(client);
        let (server_r, _server_w) = tokio::io::split(server);

        let mut writer = FrameWriter::new(&mut client_w);
        let resp = Response::Create(CreateResponse {
            handle: "abc".to_string(),
        });
        writer.write_response(&resp).await.unwrap();

        let mut reader = FrameReader::new(server_r);
        let decoded = reader.read_response().await.unwrap();
        match decoded {
            Response::Create(c) => assert_eq!(c.handle, "abc"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_a_non_digit_length_prefix() {
        let (client, server) = tokio::io::duplex(64);
        let (_client_r, mut client_w) = tokio::io::split(client);
        let (server_r, _server_w) = tokio::io::split(server);

        client_w.write_all(b"4x\r\nabcd\r\n").await.unwrap();
        drop(client_w);

        let mut reader = FrameReader::new(server_r);
        let err = reader.read_request().await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadLength(_)));
    }

    #[tokio::test]
    async fn create_request_round_trips_with_optional_fields_absent() {
        let (client, server) = tokio::io::duplex(4096);
        let (_client_r, mut client_w) = tokio::io::split(client);
        let (server_r, _server_w) = tokio::io::split(server);

        let mut writer = FrameWriter::new(&mut client_w);
        let req = Request::Create(CreateRequest {
            handle: None,
            grace_time: None,
            rlimits: None,
        });
        writer.write_request(&req).await.unwrap();

        let mut reader = FrameReader::new(server_r);
        let decoded = reader.read_request().await.unwrap();
        assert!(matches!(decoded, Request::Create(_)));
    }
}
