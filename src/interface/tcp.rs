use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use super::DeviceInterface;
use crate::error::{CommError, CommResult};

/// Client socket session over `std::net::TcpStream`.
///
/// A zero timeout switches the socket to non-blocking mode, which is how
/// "read whatever is available" is expressed for sockets.
#[derive(Debug)]
pub struct TcpDevice {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    timeout: Option<Duration>,
}

impl TcpDevice {
    pub fn new(host: impl Into<String>, port: u16, timeout: Option<Duration>) -> TcpDevice {
        TcpDevice {
            host: host.into(),
            port,
            stream: None,
            timeout,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn stream_mut(&mut self) -> CommResult<&mut TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        self.stream
            .as_mut()
            .ok_or_else(|| CommError::Communication(format!("socket to {addr} is not connected")))
    }

    fn apply_timeout(stream: &TcpStream, timeout: Option<Duration>) -> CommResult<()> {
        match timeout {
            Some(t) if t.is_zero() => stream.set_nonblocking(true)?,
            t => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(t)?;
                stream.set_write_timeout(t)?;
            }
        }
        Ok(())
    }
}

impl DeviceInterface for TcpDevice {
    fn open(&mut self) -> CommResult<()> {
        self.close()?;
        let addrs: Vec<_> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        let mut last_error = None;
        for addr in addrs {
            let connected = match self.timeout.filter(|t| !t.is_zero()) {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match connected {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    Self::apply_timeout(&stream, self.timeout)?;
                    debug!("Connected to {}", addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => e.into(),
            None => CommError::Communication(format!("{} did not resolve", self.address())),
        })
    }

    fn close(&mut self) -> CommResult<()> {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
            debug!("Disconnected from {}", self.address());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self, size: usize) -> CommResult<Vec<u8>> {
        let stream = self.stream_mut()?;
        let mut buffer = vec![0; size];
        let mut filled = 0;

        while filled < size {
            match stream.read(&mut buffer[filled..]) {
                Ok(0) if filled == 0 => {
                    return Err(CommError::Communication(
                        "connection closed by peer".to_owned(),
                    ));
                }
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        buffer.truncate(filled);
        trace!("Received bytes {:?}", buffer);
        Ok(buffer)
    }

    fn write(&mut self, data: &[u8]) -> CommResult<()> {
        self.stream_mut()?.write_all(data)?;
        trace!("Sent bytes {:?}", data);
        Ok(())
    }

    fn flush(&mut self) -> CommResult<()> {
        self.stream_mut()?.flush()?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> CommResult<()> {
        self.timeout = Some(timeout);
        if let Some(stream) = self.stream.as_ref() {
            Self::apply_timeout(stream, self.timeout)?;
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn talks_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(b"pong\r\n").unwrap();
            buf
        });

        let mut dev = TcpDevice::new("127.0.0.1", port, Some(Duration::from_secs(2)));
        dev.open().unwrap();
        assert!(dev.is_open());
        dev.write(b"ping\n").unwrap();
        let reply = dev.read(6).unwrap();
        assert_eq!(reply, b"pong\r\n");
        assert_eq!(&server.join().unwrap(), b"ping\n");

        dev.close().unwrap();
        assert!(!dev.is_open());
        assert!(dev.read(1).is_err());
    }

    #[test]
    fn short_read_on_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"ab").unwrap();
            thread::sleep(Duration::from_millis(300));
        });

        let mut dev = TcpDevice::new("127.0.0.1", port, Some(Duration::from_millis(100)));
        dev.open().unwrap();
        assert_eq!(dev.read(4).unwrap(), b"ab");
        dev.set_timeout(Duration::ZERO).unwrap();
        assert!(dev.read(4).unwrap().is_empty());
        server.join().unwrap();
    }
}
