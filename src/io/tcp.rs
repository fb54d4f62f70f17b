//! Non-blocking TCP connection with explicit connection states.

use super::{
    selector::{raw_socket, Selector},
    write::WriteBuffers,
};
use crate::error::TransportError;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io::{self, Read},
    net::SocketAddr,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    Closed,
    Connecting,
    Connected,
    Closing,
}

/// A TCP connection to one server.
///
/// Connecting happens on the first write. Data written before the connection
/// is established is buffered and sent as soon as it is. The connection
/// keeps its registration with the selector in line with its state: it waits
/// for writability while connecting or while writes are blocked, and for
/// readability while connected.
#[derive(Debug)]
pub(crate) struct TcpConnection {
    token: usize,
    address: SocketAddr,
    state: State,
    socket: Option<Socket>,
    write: WriteBuffers,
}

impl TcpConnection {
    pub(crate) fn new(token: usize, address: SocketAddr, write_hiwater: usize) -> Self {
        Self {
            token,
            address,
            state: State::Closed,
            socket: None,
            write: WriteBuffers::new(write_hiwater),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// The buffer to append outgoing data to before calling [`Self::write`].
    pub(crate) fn write_buffer(&mut self) -> &mut Vec<u8> {
        self.write.buffer()
    }

    /// Send buffered data, connecting first if necessary.
    pub(crate) fn write(&mut self, selector: &mut Selector) -> Result<(), TransportError> {
        match self.state {
            State::Closed => self.connect(selector),
            State::Connected => {
                let result = match self.socket.as_mut() {
                    Some(socket) => self.write.write(socket),
                    None => Ok(()),
                };

                self.after_write(result, selector)
            }
            // Stays buffered until connected.
            State::Connecting | State::Closing => Ok(()),
        }
    }

    fn connect(&mut self, selector: &mut Selector) -> Result<(), TransportError> {
        tracing::trace!(address = %self.address, "connecting");

        let socket = match open(self.address) {
            Ok(socket) => socket,
            Err(e) => {
                self.close(selector);
                return Err(TransportError::Connect(e));
            }
        };

        self.socket = Some(socket);
        self.state = State::Connecting;

        if let Err(e) = self.update_interest(selector) {
            self.close(selector);
            return Err(TransportError::Connect(e));
        }

        Ok(())
    }

    /// Complete a pending connect once the socket has become writable.
    pub(crate) fn on_connect(&mut self, selector: &mut Selector) -> Result<(), TransportError> {
        let result = match self.socket.as_ref() {
            Some(socket) => socket.take_error().and_then(|error| match error {
                Some(error) => Err(error),
                None => socket.set_nodelay(true),
            }),
            None => Err(io::ErrorKind::NotConnected.into()),
        };

        if let Err(e) = result {
            self.close(selector);
            return Err(TransportError::Connect(e));
        }

        tracing::trace!(address = %self.address, "connected");
        self.state = State::Connected;

        self.write(selector)
    }

    /// Continue blocked writes once the socket has become writable.
    pub(crate) fn on_writable(&mut self, selector: &mut Selector) -> Result<(), TransportError> {
        if self.state != State::Connected {
            return Ok(());
        }

        let result = match self.socket.as_mut() {
            Some(socket) => self.write.on_writable(socket),
            None => Ok(()),
        };

        self.after_write(result, selector)
    }

    fn after_write(
        &mut self,
        result: io::Result<()>,
        selector: &mut Selector,
    ) -> Result<(), TransportError> {
        match result.and_then(|_| self.update_interest(selector)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close(selector);
                Err(TransportError::Write(e))
            }
        }
    }

    /// Read from the socket. Only a connected socket is ever read.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match (self.state, self.socket.as_mut()) {
            (State::Connected, Some(socket)) => socket.read(buf),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Close the connection, dropping any unsent data. Closing a closed
    /// connection does nothing.
    pub(crate) fn close(&mut self, selector: &mut Selector) {
        self.write.reset();

        if self.state == State::Closed && self.socket.is_none() {
            return;
        }

        tracing::trace!(address = %self.address, state = ?self.state, "closing");
        self.state = State::Closing;

        if let Err(e) = selector.deregister(self.token) {
            tracing::debug!("failed to deregister socket: {}", e);
        }

        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }

        self.state = State::Closed;
    }

    fn update_interest(&self, selector: &mut Selector) -> io::Result<()> {
        if let Some(socket) = self.socket.as_ref() {
            let readable = self.state == State::Connected;
            let writable = self.state == State::Connecting || self.write.is_blocked();

            selector.register(self.token, raw_socket(socket), readable, writable)?;
        }

        Ok(())
    }
}

fn open(address: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    match socket.connect(&SockAddr::from(address)) {
        Ok(()) => Ok(socket),
        Err(e) if is_in_progress(&e) => Ok(socket),
        Err(e) => Err(e),
    }
}

fn is_in_progress(error: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if error.raw_os_error() == Some(libc::EINPROGRESS) {
            return true;
        }
    }

    error.kind() == io::ErrorKind::WouldBlock
}
