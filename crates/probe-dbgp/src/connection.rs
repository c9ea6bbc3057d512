//! Socket connection to a debugger engine.
//!
//! One `Connection` owns one TCP socket exclusively. The engine dials in,
//! so the usual way to obtain a connection is [`Connection::accept`] (or
//! the background [`Listener`](crate::listener::Listener)); outbound
//! [`Connection::connect`] exists for proxied setups.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::DbgpError;
use crate::transport::encode_message;

/// How often the accept loop re-checks for a peer.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A framed TCP connection to a debugger engine.
#[derive(Debug)]
pub struct Connection {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl Connection {
    /// Wrap an already-established stream (the Listener handover path).
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream: Some(stream),
            peer,
        }
    }

    /// Bind to `host:port` and wait for one engine to dial in.
    ///
    /// Fails with a timeout error if no peer appears within `timeout`.
    pub fn accept(host: &str, port: u16, timeout: Duration) -> Result<Self, DbgpError> {
        let bind_host = if host.is_empty() { "0.0.0.0" } else { host };
        let server = TcpListener::bind((bind_host, port))?;
        server.set_nonblocking(true)?;

        let deadline = Instant::now() + timeout;
        loop {
            match server.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    debug!("accepted engine connection from {peer}");
                    return Ok(Self {
                        stream: Some(stream),
                        peer: Some(peer),
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(DbgpError::timeout("connection"));
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Dial out to an engine-side proxy at `addr`.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, DbgpError> {
        let target = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "unresolvable address"))?;
        let stream = TcpStream::connect_timeout(&target, timeout).map_err(|e| {
            if e.kind() == ErrorKind::TimedOut {
                DbgpError::timeout("connection")
            } else {
                e.into()
            }
        })?;
        debug!("connected to engine at {target}");
        Ok(Self {
            stream: Some(stream),
            peer: Some(target),
        })
    }

    /// Whether the socket is still held.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Peer address, if the connection was ever established.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Bound the wait for each response read. `None` blocks indefinitely.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), DbgpError> {
        self.stream()?.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Release the socket. Safe to call repeatedly, including on a
    /// connection that never finished opening.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("connection closed");
        }
    }

    /// Send one framed message.
    pub fn send(&mut self, payload: &str) -> Result<(), DbgpError> {
        let frame = encode_message(payload);
        let stream = self.stream()?;
        stream.write_all(&frame)?;
        stream.flush()?;
        Ok(())
    }

    /// Receive one framed message and return its payload.
    ///
    /// Three sequential reads: decimal digits up to a NUL, exactly that
    /// many payload bytes (short reads are accumulated), and the trailing
    /// NUL. A zero-byte read anywhere mid-message means the engine went
    /// away; the connection is closed before the error is returned.
    pub fn receive(&mut self) -> Result<String, DbgpError> {
        let result = self.receive_inner();
        if matches!(result, Err(DbgpError::EndOfStream)) {
            self.close();
        }
        result
    }

    fn receive_inner(&mut self) -> Result<String, DbgpError> {
        let length = self.read_length()?;
        let body = self.read_body(length)?;
        self.read_terminator()?;
        String::from_utf8(body)
            .map_err(|e| DbgpError::malformed(format!("invalid UTF-8 payload: {e}"), ""))
    }

    /// Read the decimal length prefix up to its NUL separator.
    fn read_length(&mut self) -> Result<usize, DbgpError> {
        let mut digits = String::new();
        loop {
            let byte = self.read_byte()?;
            if byte == 0 {
                return digits.parse::<usize>().map_err(|_| {
                    DbgpError::malformed("length prefix is not a decimal number", digits.clone())
                });
            }
            if byte.is_ascii_digit() {
                digits.push(byte as char);
            }
        }
    }

    /// Read exactly `length` payload bytes.
    fn read_body(&mut self, length: usize) -> Result<Vec<u8>, DbgpError> {
        let mut body = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = match self.stream()?.read(&mut body[filled..]) {
                Ok(0) => return Err(DbgpError::EndOfStream),
                Ok(n) => n,
                Err(e) => return Err(map_read_error(e)),
            };
            filled += n;
        }
        Ok(body)
    }

    /// Consume the trailing NUL after the payload.
    fn read_terminator(&mut self) -> Result<(), DbgpError> {
        loop {
            if self.read_byte()? == 0 {
                return Ok(());
            }
        }
    }

    fn read_byte(&mut self) -> Result<u8, DbgpError> {
        let mut byte = [0u8; 1];
        match self.stream()?.read(&mut byte) {
            Ok(0) => Err(DbgpError::EndOfStream),
            Ok(_) => Ok(byte[0]),
            Err(e) => Err(map_read_error(e)),
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, DbgpError> {
        self.stream.as_mut().ok_or_else(|| {
            DbgpError::Io(std::io::Error::new(
                ErrorKind::NotConnected,
                "connection is closed",
            ))
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// A read timeout is a distinct condition from other socket faults.
fn map_read_error(e: std::io::Error) -> DbgpError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => DbgpError::timeout("response"),
        _ => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// A loopback pair: the returned stream plays the engine side.
    fn connected_pair() -> (Connection, TcpStream) {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let engine = TcpStream::connect(addr).unwrap();
        let (client_side, _) = server.accept().unwrap();
        (Connection::from_stream(client_side), engine)
    }

    #[test]
    fn send_and_receive_round_trip() {
        let (mut conn, engine) = connected_pair();
        let mut engine_conn = Connection::from_stream(engine);

        conn.send("status -i 1").unwrap();
        assert_eq!(engine_conn.receive().unwrap(), "status -i 1");

        engine_conn
            .send(r#"<response status="starting" transaction_id="1"/>"#)
            .unwrap();
        assert_eq!(
            conn.receive().unwrap(),
            r#"<response status="starting" transaction_id="1"/>"#
        );
    }

    #[test]
    fn short_reads_are_accumulated() {
        let (mut conn, mut engine) = connected_pair();
        let payload = "<init language=\"php\" idekey=\"k\"/>";

        // Dribble the frame a few bytes at a time.
        let frame = encode_message(payload);
        let handle = std::thread::spawn(move || {
            for chunk in frame.chunks(3) {
                engine.write_all(chunk).unwrap();
                engine.flush().unwrap();
                std::thread::sleep(Duration::from_millis(2));
            }
        });

        assert_eq!(conn.receive().unwrap(), payload);
        handle.join().unwrap();
    }

    #[test]
    fn peer_disconnect_mid_message_is_end_of_stream() {
        let (mut conn, mut engine) = connected_pair();

        // Length prefix promises more bytes than ever arrive.
        engine.write_all(b"100\0<resp").unwrap();
        engine.flush().unwrap();
        drop(engine);

        let err = conn.receive().unwrap_err();
        assert!(matches!(err, DbgpError::EndOfStream));
        // The failed read forced a close.
        assert!(!conn.is_connected());
    }

    #[test]
    fn read_timeout_is_a_timeout_error() {
        let (mut conn, _engine) = connected_pair();
        conn.set_read_timeout(Some(Duration::from_millis(30))).unwrap();

        let err = conn.receive().unwrap_err();
        assert!(matches!(err, DbgpError::Timeout { .. }));
        // Timeouts do not implicitly close; the session decides.
        assert!(conn.is_connected());
    }

    #[test]
    fn close_is_idempotent() {
        let (mut conn, _engine) = connected_pair();
        assert!(conn.is_connected());
        conn.close();
        conn.close();
        assert!(!conn.is_connected());

        let err = conn.send("status").unwrap_err();
        assert!(matches!(err, DbgpError::Io(_)));
    }

    #[test]
    fn accept_times_out_without_peer() {
        let start = Instant::now();
        let err = Connection::accept("127.0.0.1", 0, Duration::from_millis(80)).unwrap_err();
        assert!(matches!(err, DbgpError::Timeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn accept_picks_up_a_dialing_engine() {
        // Port 0 means we cannot know the port in advance, so bind
        // explicitly and race a connect thread against accept.
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let dialer = std::thread::spawn(move || {
            // Retry until the acceptor has bound.
            for _ in 0..100 {
                if TcpStream::connect(addr).is_ok() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            panic!("never connected");
        });

        let conn = Connection::accept("127.0.0.1", addr.port(), Duration::from_secs(5)).unwrap();
        assert!(conn.is_connected());
        assert!(conn.peer_addr().is_some());
        dialer.join().unwrap();
    }

    #[test]
    fn connect_dials_a_listening_server() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let conn = Connection::connect(&addr.to_string(), Duration::from_secs(5)).unwrap();
        assert!(conn.is_connected());
        server.accept().unwrap();
    }

    #[test]
    fn garbage_length_prefix_is_malformed() {
        let (mut conn, mut engine) = connected_pair();
        // Only non-digits before the NUL: nothing to parse.
        engine.write_all(b"abc\0").unwrap();
        engine.flush().unwrap();

        let err = conn.receive().unwrap_err();
        assert!(matches!(err, DbgpError::MalformedResponse { .. }));
    }
}
