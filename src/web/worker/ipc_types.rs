//! IPC protocol types for server ↔ worker communication.
//!
//! Each model's worker binds a Unix domain socket; the server connects to it.
//! Messages are length-delimited frames (4-byte big-endian length prefix)
//! carrying opaque payload bytes. Every request frame is answered by exactly
//! one reply frame.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const ENDPOINT_SCHEME: &str = "ipc://";

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// An established, framed connection to a worker.
pub type IpcConnection = Framed<UnixStream, LengthDelimitedCodec>;

/// Address of a worker's socket, rendered as `ipc://<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcEndpoint {
    path: PathBuf,
}

impl IpcEndpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<socket_dir>/<model_id>.sock`
    pub fn for_model(socket_dir: &Path, model_id: &str) -> Self {
        Self::new(socket_dir.join(format!("{model_id}.sock")))
    }

    pub fn parse(s: &str) -> Option<Self> {
        let path = s.strip_prefix(ENDPOINT_SCHEME)?;
        if path.is_empty() {
            return None;
        }
        Some(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for IpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ENDPOINT_SCHEME}{}", self.path.display())
    }
}

/// Opaque request/response body. The server never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(Bytes);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<&'static str> for Payload {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Wrap a raw stream in the frame codec.
pub fn frame(stream: UnixStream) -> IpcConnection {
    Framed::new(stream, codec())
}

/// Connect to a worker's endpoint (server side).
pub async fn connect(endpoint: &IpcEndpoint) -> io::Result<IpcConnection> {
    let stream = UnixStream::connect(endpoint.path()).await?;
    Ok(frame(stream))
}

/// Bind an endpoint (worker side), replacing a stale socket file if present.
pub fn bind(endpoint: &IpcEndpoint) -> io::Result<UnixListener> {
    remove_socket(endpoint)?;
    UnixListener::bind(endpoint.path())
}

/// Remove the socket file; a missing file is not an error.
pub fn remove_socket(endpoint: &IpcEndpoint) -> io::Result<()> {
    match std::fs::remove_file(endpoint.path()) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Send one request frame and wait for the single reply frame.
pub async fn exchange(conn: &mut IpcConnection, request: Payload) -> io::Result<Payload> {
    conn.send(request.into_bytes()).await?;
    match conn.next().await {
        Some(reply) => Ok(Payload::from(reply?.freeze())),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "worker closed the connection",
        )),
    }
}

/// Errors that mean the peer is gone rather than that a message was bad.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_round_trips_through_display() {
        let ep = IpcEndpoint::for_model(Path::new("/tmp/mlserve"), "abc");
        assert_eq!(ep.to_string(), "ipc:///tmp/mlserve/abc.sock");
        assert_eq!(IpcEndpoint::parse(&ep.to_string()), Some(ep));
    }

    #[test]
    fn test_endpoint_parse_rejects_other_schemes() {
        assert_eq!(IpcEndpoint::parse("tcp://127.0.0.1:5555"), None);
        assert_eq!(IpcEndpoint::parse("ipc://"), None);
    }

    #[tokio::test]
    async fn test_exchange_is_one_frame_each_way() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut client = frame(client);
        let mut server = frame(server);

        let responder = tokio::spawn(async move {
            let request = server.next().await.unwrap().unwrap();
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&request);
            server.send(Bytes::from(reply)).await.unwrap();
        });

        let reply = exchange(&mut client, Payload::from("a\nb")).await.unwrap();
        assert_eq!(reply.as_bytes(), b"re:a\nb");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_reports_hangup_as_disconnect() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut client = frame(client);
        drop(server);

        let err = exchange(&mut client, Payload::from("ping")).await.unwrap_err();
        assert!(is_disconnect(&err), "unexpected error kind: {err:?}");
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let ep = IpcEndpoint::for_model(dir.path(), "stale");
        std::fs::write(ep.path(), b"").unwrap();

        let _listener = bind(&ep).unwrap();
        assert!(connect(&ep).await.is_ok());
    }
}
