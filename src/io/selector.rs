use polling::{Event, Poller};
use std::{collections::HashMap, io, sync::Arc, task::Waker, time::Duration};

#[cfg(unix)]
pub(crate) type RawSocket = std::os::unix::io::RawFd;
#[cfg(windows)]
pub(crate) type RawSocket = std::os::windows::io::RawSocket;

#[cfg(unix)]
pub(crate) fn raw_socket(socket: &socket2::Socket) -> RawSocket {
    std::os::unix::io::AsRawFd::as_raw_fd(socket)
}

#[cfg(windows)]
pub(crate) fn raw_socket(socket: &socket2::Socket) -> RawSocket {
    std::os::windows::io::AsRawSocket::as_raw_socket(socket)
}

/// Readiness selector for the sockets of one I/O thread.
///
/// Sockets are registered under a token chosen by the caller, which is what
/// events are reported with. Registrations are persistent even though the
/// underlying poller is oneshot.
pub(crate) struct Selector {
    poller: Arc<Poller>,

    /// Registered sockets by token.
    sockets: HashMap<usize, Registration>,

    /// Events of the most recent poll, reused between calls.
    events: Vec<Event>,

    /// Incrementing counter used to deduplicate registration operations.
    tick: usize,
}

struct Registration {
    socket: RawSocket,
    readable: bool,
    writable: bool,
    tick: usize,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            sockets: HashMap::new(),
            events: Vec::new(),
            tick: 0,
        })
    }

    /// Get a waker that interrupts this selector while it is waiting.
    pub(crate) fn waker(&self) -> Waker {
        waker_fn::waker_fn({
            let poller = self.poller.clone();

            move || {
                let _ = poller.notify();
            }
        })
    }

    /// Register a socket, or update the interest of a registered one.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn register(
        &mut self,
        token: usize,
        socket: RawSocket,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let previous = self.sockets.insert(
            token,
            Registration {
                socket,
                readable,
                writable,
                tick: self.tick,
            },
        );

        let event = Event {
            key: token,
            readable,
            writable,
        };

        match previous {
            Some(previous) if previous.socket == socket => poller_modify(&self.poller, socket, event),
            _ => poller_add(&self.poller, socket, event),
        }
    }

    /// Stop receiving events for a socket.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn deregister(&mut self, token: usize) -> io::Result<()> {
        if let Some(registration) = self.sockets.remove(&token) {
            // The socket may already be closed, in which case some pollers
            // have forgotten about it on their own.
            filter_error(self.poller.delete(registration.socket))?;
        }

        Ok(())
    }

    /// Block until socket activity is detected, the timeout passes or the
    /// selector is woken up.
    ///
    /// Returns `true` if one or more socket events occurred.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn poll(&mut self, timeout: Duration) -> io::Result<bool> {
        // Re-arm sockets that fired last time, unless they were re-registered
        // in the meantime. This is done as late as possible because sockets
        // may get deregistered in between.
        for event in self.events.drain(..) {
            if let Some(registration) = self.sockets.get_mut(&event.key) {
                if registration.tick != self.tick {
                    poller_modify(
                        &self.poller,
                        registration.socket,
                        Event {
                            key: event.key,
                            readable: registration.readable,
                            writable: registration.writable,
                        },
                    )?;
                    registration.tick = self.tick;
                }
            }
        }

        self.tick = self.tick.wrapping_add(1);

        match self.poller.wait(&mut self.events, Some(timeout)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Events that occurred during the most recent call to `poll`, as
    /// `(token, readable, writable)`.
    pub(crate) fn events(&self) -> Vec<(usize, bool, bool)> {
        self.events
            .iter()
            .map(|event| (event.key, event.readable, event.writable))
            .collect()
    }
}

fn poller_add(poller: &Poller, socket: RawSocket, event: Event) -> io::Result<()> {
    // A new socket may reuse the descriptor of a closed one that the poller
    // still knows about, in which case adding fails and modifying works.
    if let Err(e) = filter_error(poller.add(socket, event)) {
        tracing::debug!("failed to add interest for socket {:?}, retrying as a modify: {}", socket, e);
        filter_error(poller.modify(socket, event))?;
    }

    Ok(())
}

fn poller_modify(poller: &Poller, socket: RawSocket, event: Event) -> io::Result<()> {
    if let Err(e) = filter_error(poller.modify(socket, event)) {
        tracing::debug!("failed to modify interest for socket {:?}, retrying as an add: {}", socket, e);
        filter_error(poller.add(socket, event))?;
    }

    Ok(())
}

fn filter_error(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.raw_os_error() == Some(libc::EBADF) => Ok(()),
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, time::Instant};

    #[test]
    fn waker_interrupts_poll() {
        let mut selector = Selector::new().unwrap();
        let waker = selector.waker();

        waker.wake_by_ref();

        let start = Instant::now();
        assert!(!selector.poll(Duration::from_secs(5)).unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn reports_events_by_token() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let socket = socket2::Socket::from(std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap());
        let mut selector = Selector::new().unwrap();

        selector.register(7, raw_socket(&socket), false, true).unwrap();

        assert!(selector.poll(Duration::from_secs(5)).unwrap());
        assert_eq!(selector.events(), [(7, false, true)]);

        selector.deregister(7).unwrap();
        selector.deregister(7).unwrap();
    }
}
