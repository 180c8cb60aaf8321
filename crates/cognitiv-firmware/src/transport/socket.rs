use embassy_net::tcp::TcpSocket;
use embassy_net::{IpEndpoint, Stack};
use embedded_io_async::{ErrorKind, ErrorType, Read, Write};

/// Failure on the raw TCP stream under TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    Connect,
    Io,
}

impl embedded_io_async::Error for SocketError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect => ErrorKind::ConnectionRefused,
            Self::Io => ErrorKind::BrokenPipe,
        }
    }
}

/// embassy-net TCP socket exposed through the `embedded-io-async` traits the
/// TLS layer reads and writes through.
pub struct AsyncTcpSocket<'a> {
    socket: TcpSocket<'a>,
}

impl<'a> AsyncTcpSocket<'a> {
    pub fn new(stack: Stack<'a>, rx_buffer: &'a mut [u8], tx_buffer: &'a mut [u8]) -> Self {
        Self {
            socket: TcpSocket::new(stack, rx_buffer, tx_buffer),
        }
    }

    pub async fn connect(&mut self, endpoint: IpEndpoint) -> Result<(), SocketError> {
        self.socket
            .connect(endpoint)
            .await
            .map_err(|_| SocketError::Connect)
    }
}

impl Drop for AsyncTcpSocket<'_> {
    fn drop(&mut self) {
        self.socket.abort();
    }
}

impl ErrorType for AsyncTcpSocket<'_> {
    type Error = SocketError;
}

impl Read for AsyncTcpSocket<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.socket.read(buf).await.map_err(|_| SocketError::Io)
    }
}

impl Write for AsyncTcpSocket<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.socket.write(buf).await.map_err(|_| SocketError::Io)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.socket.flush().await.map_err(|_| SocketError::Io)
    }
}
