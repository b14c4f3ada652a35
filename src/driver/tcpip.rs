//! Raw SCPI socket transport.
//!
//! LXI instruments (the DG4202 and EDUX1002A included) expose a raw SCPI
//! socket, conventionally on port 5025. `TCPIP::<host>::INSTR` addresses are
//! mapped onto that socket; `TCPIP::<host>::<port>::SOCKET` selects the port
//! explicitly.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{scpi, ConnectionSettings, DriverError, InstrumentIo};

/// Port used for `::INSTR` addresses.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// SCPI over TCP. Connects lazily and reconnects after any failure.
#[derive(Debug)]
pub struct TcpipDriver {
    resource: String,
    host: String,
    port: u16,
    settings: ConnectionSettings,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpipDriver {
    /// Driver for `host:port`; no connection is made until first use.
    pub fn new(
        resource: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            resource: resource.into(),
            host: host.into(),
            port,
            settings,
            stream: Mutex::new(None),
        }
    }

    /// Target socket address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>, DriverError> {
        let timeout = self.settings.connect_timeout;
        debug!(resource = %self.resource, addr = %self.socket_addr(), "Connecting");
        let stream = tokio::time::timeout(timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| DriverError::timeout(&self.resource, timeout))?
            .map_err(|e| DriverError::io(&self.resource, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(resource = %self.resource, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(BufReader::new(stream))
    }

    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        read_response: bool,
    ) -> Result<Option<String>, DriverError> {
        let mut slot = self.stream.lock().await;
        // The stream is taken out of the slot for the duration of the
        // exchange and only put back on success.
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };
        let result = scpi::exchange(
            &self.resource,
            &mut stream,
            command,
            &self.settings,
            timeout,
            read_response,
        )
        .await;
        match &result {
            Ok(_) => *slot = Some(stream),
            Err(e) => debug!(resource = %self.resource, error = %e, "Dropping connection"),
        }
        result
    }
}

#[async_trait]
impl InstrumentIo for TcpipDriver {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&self, command: &str, timeout: Duration) -> Result<(), DriverError> {
        self.run(command, timeout, false).await.map(|_| ())
    }

    async fn query(&self, command: &str, timeout: Duration) -> Result<String, DriverError> {
        self.run(command, timeout, true)
            .await?
            .ok_or_else(|| DriverError::Parse {
                resource: self.resource.clone(),
                message: "no response".to_string(),
            })
    }

    async fn disconnect(&self) {
        self.stream.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal SCPI server answering `*IDN?` and `:FREQ?`, ignoring writes.
    async fn spawn_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut socket = BufReader::new(socket);
                    let mut line = String::new();
                    while socket.read_line(&mut line).await.unwrap_or(0) > 0 {
                        let reply = match line.trim() {
                            "*IDN?" => Some("TEST,SCPI-SERVER,0,1.0\n"),
                            ":FREQ?" => Some("+1.000000E+03\n"),
                            _ => None,
                        };
                        if let Some(reply) = reply {
                            if socket.write_all(reply.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        line.clear();
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn queries_and_writes_over_socket() {
        let port = spawn_server().await;
        let driver = TcpipDriver::new(
            format!("TCPIP::127.0.0.1::{port}::SOCKET"),
            "127.0.0.1",
            port,
            ConnectionSettings::default(),
        );

        let idn = driver
            .query("*IDN?", Duration::from_secs(1))
            .await
            .expect("idn");
        assert_eq!(idn, "TEST,SCPI-SERVER,0,1.0");

        driver
            .write(":FREQ 1000", Duration::from_secs(1))
            .await
            .expect("write");
        let freq = driver
            .query(":FREQ?", Duration::from_secs(1))
            .await
            .expect("freq");
        assert_eq!(freq, "+1.000000E+03");
    }

    #[tokio::test]
    async fn unanswered_query_times_out_and_reconnects() {
        let port = spawn_server().await;
        let driver = TcpipDriver::new("local", "127.0.0.1", port, ConnectionSettings::default());

        let err = driver
            .query(":UNKNOWN?", Duration::from_millis(50))
            .await
            .expect_err("server never answers");
        assert!(matches!(err, DriverError::Timeout { .. }));

        // a fresh connection is used afterwards
        let idn = driver
            .query("*IDN?", Duration::from_secs(1))
            .await
            .expect("idn after reconnect");
        assert!(idn.starts_with("TEST"));
    }

    #[tokio::test]
    async fn refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let driver = TcpipDriver::new("gone", "127.0.0.1", port, ConnectionSettings::default());
        let err = driver
            .write("*RST", Duration::from_millis(200))
            .await
            .expect_err("nothing listening");
        assert_eq!(err.kind(), sonaris_core::ErrorKind::Io);
    }
}
