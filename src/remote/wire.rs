//! Wire protocol for the dispatch layer.
//!
//! Every frame is one internally tagged JSON object on its own line.
//! Binary chunks ride base64-encoded in `FileChunk` frames of at most
//! [`crate::store::CHUNK_SIZE`] payload bytes; a zero-length chunk
//! terminates a transfer. Each connection carries at most one file
//! transfer per direction at a time, which keeps chunk order trivially
//! intact.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::events::Event;
use crate::proto::{ExecutionRequest, Response};
use crate::store::{self, ChunkWriter, Digest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Worker registration; one connection per worker slot.
    WorkerHello { name: String, capacity: u32 },
    /// Opens a client session.
    ClientHello { name: String },
    /// Client submits a request under a session-scoped id.
    Execute { id: u64, request: ExecutionRequest },
    /// Server answers an `Execute`.
    ExecuteDone { id: u64, response: Response },
    /// Server hands work to a worker slot.
    Work { id: u64, request: ExecutionRequest },
    /// Worker answers a `Work` item.
    WorkDone { id: u64, response: Response },
    /// Ask the peer to stream an artifact.
    FileRequest { digest: Digest },
    /// One chunk of an artifact stream; empty data ends the stream.
    FileChunk {
        digest: Digest,
        #[serde(with = "crate::proto::b64")]
        data: Vec<u8>,
    },
    /// Negative answer to a `FileRequest`.
    FileNotFound { digest: Digest },
    /// Server-to-client event stream element.
    Event { event: Event },
}

/// One framed dispatch connection.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            line: String::new(),
        }
    }

    pub async fn send(&mut self, message: &WireMessage) -> Result<()> {
        let mut frame = serde_json::to_vec(message).context("encoding frame")?;
        frame.push(b'\n');
        self.writer
            .write_all(&frame)
            .await
            .context("connection write")?;
        Ok(())
    }

    /// Next frame, or `None` when the peer closed the connection.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>> {
        self.line.clear();
        let n = self
            .reader
            .read_line(&mut self.line)
            .await
            .context("connection read")?;
        if n == 0 {
            return Ok(None);
        }
        let message = serde_json::from_str(self.line.trim_end())
            .with_context(|| format!("malformed frame: {}", self.line.trim_end()))?;
        Ok(Some(message))
    }

    /// Streams the file at `path` to the peer as `digest`.
    pub async fn send_file(&mut self, digest: &Digest, path: &std::path::Path) -> Result<()> {
        for chunk in store::read(path)? {
            self.send(&WireMessage::FileChunk {
                digest: *digest,
                data: chunk?,
            })
            .await?;
        }
        self.send(&WireMessage::FileChunk {
            digest: *digest,
            data: Vec::new(),
        })
        .await
    }

    /// Receives the stream for `digest` into `sink`, consuming frames up to
    /// and including the zero-length terminator.
    pub async fn recv_file(&mut self, digest: &Digest, sink: &mut ChunkWriter) -> Result<()> {
        loop {
            match self.recv().await? {
                Some(WireMessage::FileChunk { digest: d, data }) if d == *digest => {
                    let done = data.is_empty();
                    sink.push(&data)?;
                    if done {
                        return Ok(());
                    }
                }
                Some(WireMessage::FileNotFound { digest: d }) if d == *digest => {
                    bail!("peer does not have artifact {}", d)
                }
                Some(other) => bail!("unexpected frame during file transfer: {:?}", other),
                None => bail!("connection closed during file transfer"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{FileInfo, FileRole};

    fn round_trip(message: WireMessage) {
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(serde_json::from_str::<WireMessage>(&json).unwrap(), message);
    }

    #[test]
    fn test_frame_round_trips() {
        round_trip(WireMessage::WorkerHello {
            name: "w0".into(),
            capacity: 4,
        });
        let mut request = ExecutionRequest::new("sol");
        request.inputs.push(
            FileInfo::new("sol", FileRole::Input).with_digest(Digest::of_bytes(b"binary")),
        );
        round_trip(WireMessage::Execute { id: 1, request });
        round_trip(WireMessage::FileChunk {
            digest: Digest::of_bytes(b"x"),
            data: vec![0, 1, 2, 254, 255],
        });
        round_trip(WireMessage::FileNotFound {
            digest: Digest::of_bytes(b"y"),
        });
    }

    #[test]
    fn test_chunk_payload_is_base64() {
        let message = WireMessage::FileChunk {
            digest: Digest::of_bytes(b"x"),
            data: b"\x00\xffbinary".to_vec(),
        };
        let json = serde_json::to_string(&message).unwrap();
        // Raw bytes never appear in the frame; only their base64 form.
        assert!(json.contains("AP9iaW5hcnk="));
    }

    #[tokio::test]
    async fn test_send_recv_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let message = conn.recv().await.unwrap().unwrap();
            conn.send(&message).await.unwrap();
        });
        let mut conn = Connection::new(TcpStream::connect(addr).await.unwrap());
        let sent = WireMessage::ClientHello { name: "c".into() };
        conn.send(&sent).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Some(sent));
        server.await.unwrap();
    }
}
