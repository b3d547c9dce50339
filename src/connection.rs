//! TCP connection management.
//!
//! This module provides the RESP connection used by the consumers. Besides
//! plain request/reply it keeps server push messages apart from replies:
//! pushes that arrive while a reply is awaited are queued, and
//! [`Connection::try_next_push`] drains whatever is already readable
//! without waiting.

use std::collections::VecDeque;
use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::resp;
use crate::transport::{SubscriptionKind, Transport, MESSAGE_KINDS};
use crate::types::Value;

/// Default read/write buffer size (8 KB).
const DEFAULT_BUF_SIZE: usize = 8 * 1024;

/// RESP protocol version to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// RESP2; pushes are recognised by their message kind once subscribed.
    Resp2,
    /// RESP3 via `HELLO 3`; pushes arrive as `>` frames.
    #[default]
    Resp3,
}

/// Configuration for connecting to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Optional password for AUTH.
    pub password: Option<String>,
    /// Database index to SELECT on connect.
    pub database: u8,
    /// Read/write buffer size in bytes.
    pub buffer_size: usize,
    /// Preferred protocol version. RESP3 falls back to RESP2 when the
    /// server does not understand `HELLO`.
    pub protocol: Protocol,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
            database: 0,
            buffer_size: DEFAULT_BUF_SIZE,
            protocol: Protocol::Resp3,
        }
    }
}

impl ConnectionConfig {
    /// Create a config from a host and port.
    pub fn from_addr(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// The `host:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A TCP stream with buffered RESP I/O and a queue of pending pushes.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    protocol: Protocol,
    database: u8,
    subscribed: bool,
    pushes: VecDeque<Value>,
}

impl Connection {
    /// Open a new connection using the given configuration.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let tcp = TcpStream::connect(config.address()).await?;
        tcp.set_nodelay(true).map_err(Error::Io)?;

        let mut conn = Self {
            stream: tcp,
            read_buf: BytesMut::with_capacity(config.buffer_size),
            write_buf: BytesMut::with_capacity(config.buffer_size),
            protocol: Protocol::Resp2,
            database: 0,
            subscribed: false,
            pushes: VecDeque::new(),
        };

        let mut authenticated = false;
        if config.protocol == Protocol::Resp3 {
            authenticated = conn.negotiate_resp3(config.password.as_deref()).await?;
        }

        if let (Some(password), false) = (config.password.as_deref(), authenticated) {
            let reply = conn
                .execute(vec![Bytes::from("AUTH"), Bytes::copy_from_slice(password.as_bytes())])
                .await
                .map_err(|e| Error::Auth(e.to_string()))?;
            if !reply.is_ok() {
                return Err(Error::Auth(format!("unexpected AUTH response: {}", reply)));
            }
        }

        if config.database != 0 {
            let reply = conn
                .execute(vec![Bytes::from("SELECT"), Bytes::from(config.database.to_string())])
                .await?;
            if !reply.is_ok() {
                return Err(Error::Protocol(format!("unexpected SELECT response: {}", reply)));
            }
        }
        conn.database = config.database;

        debug!(
            addr = %config.address(),
            protocol = ?conn.protocol,
            database = conn.database,
            "connected"
        );
        Ok(conn)
    }

    /// Try `HELLO 3`, returning whether it also authenticated the connection.
    async fn negotiate_resp3(&mut self, password: Option<&str>) -> Result<bool> {
        let mut args = vec![Bytes::from("HELLO"), Bytes::from("3")];
        if let Some(password) = password {
            args.push(Bytes::from("AUTH"));
            args.push(Bytes::from("default"));
            args.push(Bytes::copy_from_slice(password.as_bytes()));
        }

        match self.execute(args).await {
            Ok(Value::Map(_)) => {
                self.protocol = Protocol::Resp3;
                Ok(password.is_some())
            }
            Ok(other) => Err(Error::unexpected("map", other.type_name())),
            Err(Error::Server(msg)) if msg.starts_with("WRONGPASS") => Err(Error::Auth(msg)),
            Err(Error::Server(msg)) => {
                warn!(reply = %msg, "HELLO 3 rejected, falling back to RESP2");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// The protocol version in use after negotiation.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Wait until the socket has data to read.
    ///
    /// Lets an event loop sleep until [`try_next_push`](Self::try_next_push)
    /// has something to return. A partial frame already buffered does not
    /// count; the wait continues until more bytes arrive.
    pub async fn readable(&self) -> Result<()> {
        if !self.pushes.is_empty() || resp::frame_ready(&self.read_buf) {
            return Ok(());
        }
        self.stream.readable().await?;
        Ok(())
    }

    /// Send a raw command without reading a response.
    pub async fn send_command(&mut self, args: &[Bytes]) -> Result<()> {
        self.write_buf.clear();
        resp::encode_command(args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }

    /// Read the next complete frame, waiting for data if needed.
    async fn read_frame(&mut self) -> Result<Value> {
        loop {
            if let Some(value) = resp::decode_value(&mut self.read_buf)? {
                return Ok(value);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Read the reply to the last command, queueing pushes seen on the way.
    async fn read_reply(&mut self) -> Result<Value> {
        loop {
            let value = self.read_frame().await?;
            if self.is_push(&value) {
                self.pushes.push_back(value);
                continue;
            }
            return match value {
                Value::Error(msg) => Err(Error::Server(msg)),
                other => Ok(other),
            };
        }
    }

    fn is_push(&self, value: &Value) -> bool {
        match value {
            Value::Push(_) => true,
            Value::Array(parts) if self.protocol == Protocol::Resp2 && self.subscribed => parts
                .first()
                .and_then(Value::as_str)
                .map(|kind| MESSAGE_KINDS.iter().any(|k| kind.eq_ignore_ascii_case(k)))
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn is_confirmation(value: &Value, kind: SubscriptionKind, channel: &[u8]) -> bool {
    let parts = match value {
        Value::Push(parts) | Value::Array(parts) => parts,
        _ => return false,
    };
    let kind_matches = parts
        .first()
        .and_then(Value::as_str)
        .map(|k| k.eq_ignore_ascii_case(kind.confirmation()))
        .unwrap_or(false);
    kind_matches && parts.get(1).and_then(Value::as_bytes) == Some(channel)
}

#[async_trait]
impl Transport for Connection {
    async fn execute(&mut self, args: Vec<Bytes>) -> Result<Value> {
        self.send_command(&args).await?;
        self.read_reply().await
    }

    async fn subscribe(&mut self, kind: SubscriptionKind, channel: Bytes) -> Result<()> {
        self.send_command(&[Bytes::from(kind.command()), channel.clone()])
            .await?;
        loop {
            let value = self.read_frame().await?;
            if is_confirmation(&value, kind, &channel) {
                self.subscribed = true;
                return Ok(());
            }
            match value {
                Value::Error(msg) => return Err(Error::Server(msg)),
                v if self.is_push(&v) => self.pushes.push_back(v),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected reply to {}: {}",
                        kind.command(),
                        other
                    )))
                }
            }
        }
    }

    fn try_next_push(&mut self) -> Result<Option<Value>> {
        if let Some(value) = self.pushes.pop_front() {
            return Ok(Some(value));
        }
        loop {
            if let Some(value) = resp::decode_value(&mut self.read_buf)? {
                if self.is_push(&value) {
                    return Ok(Some(value));
                }
                return Err(Error::Protocol(format!("unsolicited reply: {}", value)));
            }
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn database(&self) -> u8 {
        self.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Serve one connection, answering each request with the next canned
    /// response and then writing any trailing bytes.
    async fn scripted_server(responses: Vec<&'static str>, trailing: Option<&'static str>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            for response in responses {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                socket.write_all(response.as_bytes()).await.unwrap();
            }
            if let Some(extra) = trailing {
                tokio::time::sleep(Duration::from_millis(20)).await;
                socket.write_all(extra.as_bytes()).await.unwrap();
            }
            // Hold the socket open until the client is done.
            let _ = socket.read(&mut buf).await;
        });
        port
    }

    fn resp2_config(port: u16) -> ConnectionConfig {
        ConnectionConfig {
            protocol: Protocol::Resp2,
            ..ConnectionConfig::from_addr("127.0.0.1", port)
        }
    }

    #[tokio::test]
    async fn test_push_before_reply_is_queued() {
        let port = scripted_server(
            vec![">4\r\n$8\r\npmessage\r\n$1\r\np\r\n$1\r\nk\r\n$3\r\ndel\r\n:7\r\n"],
            None,
        )
        .await;
        let mut conn = Connection::connect(&resp2_config(port)).await.unwrap();

        let reply = conn.execute(vec![Bytes::from("SCARD"), Bytes::from("s")]).await.unwrap();
        assert_eq!(reply, Value::Integer(7));

        let push = conn.try_next_push().unwrap().unwrap();
        assert!(push.is_push());
        assert_eq!(push.into_message_parts().unwrap().len(), 4);
        assert!(conn.try_next_push().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_try_next_push_reads_late_arrivals() {
        let port = scripted_server(
            vec!["*3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n"],
            Some("*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$1\r\nG\r\n"),
        )
        .await;
        let mut conn = Connection::connect(&resp2_config(port)).await.unwrap();
        conn.subscribe(SubscriptionKind::Channel, Bytes::from("ch"))
            .await
            .unwrap();
        assert!(conn.try_next_push().unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.readable().await.unwrap();
        let msg = conn.try_next_push().unwrap().unwrap();
        let parts = msg.into_message_parts().unwrap();
        assert_eq!(parts[0].as_str(), Some("message"));
        assert_eq!(parts[2].as_str(), Some("G"));
    }

    #[tokio::test]
    async fn test_readable_waits_on_partial_frame() {
        let port = scripted_server(
            vec!["*3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n"],
            Some("*3\r\n$7\r\nmessage\r\n$2\r\nch"),
        )
        .await;
        let mut conn = Connection::connect(&resp2_config(port)).await.unwrap();
        conn.subscribe(SubscriptionKind::Channel, Bytes::from("ch"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Pulls the half frame into the read buffer.
        assert!(conn.try_next_push().unwrap().is_none());

        let waited = tokio::time::timeout(Duration::from_millis(100), conn.readable()).await;
        assert!(waited.is_err(), "readable returned with only half a frame buffered");
        assert!(conn.try_next_push().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_returned() {
        let port = scripted_server(vec!["-NOSCRIPT No matching script\r\n"], None).await;
        let mut conn = Connection::connect(&resp2_config(port)).await.unwrap();
        let err = conn
            .execute(vec![Bytes::from("EVALSHA"), Bytes::from("abc"), Bytes::from("0")])
            .await
            .unwrap_err();
        assert!(err.is_noscript());
    }

    #[tokio::test]
    async fn test_hello_rejected_falls_back_to_resp2() {
        let port = scripted_server(
            vec!["-ERR unknown command 'HELLO'\r\n", "+PONG\r\n"],
            None,
        )
        .await;
        let mut conn = Connection::connect(&ConnectionConfig::from_addr("127.0.0.1", port))
            .await
            .unwrap();
        assert_eq!(conn.protocol(), Protocol::Resp2);
        let reply = conn.execute(vec![Bytes::from("PING")]).await.unwrap();
        assert_eq!(reply, Value::Status("PONG".into()));
    }

    #[tokio::test]
    async fn test_hello_accepted_selects_resp3() {
        let port = scripted_server(
            vec!["%1\r\n$5\r\nproto\r\n:3\r\n", "+OK\r\n"],
            None,
        )
        .await;
        let config = ConnectionConfig {
            database: 4,
            ..ConnectionConfig::from_addr("127.0.0.1", port)
        };
        let conn = Connection::connect(&config).await.unwrap();
        assert_eq!(conn.protocol(), Protocol::Resp3);
        assert_eq!(conn.database(), 4);
    }
}
