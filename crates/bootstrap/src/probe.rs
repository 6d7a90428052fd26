use std::io;
use std::time::Duration;

/// Answers "is something accepting TCP connections at `addr`?".
///
/// A successful connect is the only signal; nothing is sent over the connection.
#[async_trait::async_trait]
pub trait PortProbe: Send + Sync {
    async fn connect(&self, addr: &str) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct TcpProbe {
    /// Upper bound for a single connect attempt, so an unroutable peer can't stall a poll loop.
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait::async_trait]
impl PortProbe for TcpProbe {
    async fn connect(&self, addr: &str) -> io::Result<()> {
        match tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(addr)).await {
            Ok(stream) => stream.map(drop),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {addr} timed out"),
            )),
        }
    }
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
