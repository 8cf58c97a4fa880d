use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use shipyard_shared::protocol::{MAX_MESSAGE_BYTES, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// One-shot client for the control socket.
#[derive(Clone, Debug)]
pub struct DaemonClient {
    addr: String,
}

impl DaemonClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send `request` on a fresh connection and read the single reply.
    pub async fn send(&self, request: &Request) -> ShipyardResult<Response> {
        let mut stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|e| ShipyardError::DaemonUnreachable {
                    addr: self.addr.clone(),
                    reason: e.to_string(),
                })?;

        stream.write_all(&request.to_wire()?).await?;
        stream.shutdown().await?;

        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES as u64 + 1)
            .read_to_end(&mut buf)
            .await?;
        if buf.len() > MAX_MESSAGE_BYTES {
            return Err(ShipyardError::Protocol("response too large".into()));
        }
        if buf.is_empty() {
            return Err(ShipyardError::Protocol(
                "daemon closed the connection without replying".into(),
            ));
        }

        Response::from_wire(&buf)
    }

    /// Whether anything accepts connections at the address.
    pub async fn is_reachable(&self) -> bool {
        TcpStream::connect(&self.addr).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = DaemonClient::new(&addr)
            .send(&Request::Stop {
                ship_name: "web".into(),
                force: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShipyardError::DaemonUnreachable { .. }));
        assert!(err.to_string().contains("shipyard daemon start"));
    }
}
