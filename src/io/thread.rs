//! I/O threads, each running its own event loop over a set of sessions.
//!
//! An I/O thread owns one session per discovered server and a queue of
//! requests to distribute among them. It is attached to a [`Handle`] through
//! which requests are queued and shutdown is requested.

use super::{
    intake::Intake,
    selector::Selector,
    session::{retry, Io, IoSession},
    timer::Interval,
};
use crate::{
    config::Config, discovery::ServiceDiscovery, error::Error, error::TransportError,
    reply::lock, request::Submission,
};
use async_channel::{Receiver, Sender, TrySendError};
use crossbeam_utils::{atomic::AtomicCell, sync::WaitGroup};
use event_listener::Event;
use slab::Slab;
use std::{
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
    task::Waker,
    thread,
    time::{Duration, Instant},
};

static NEXT_THREAD_ID: AtomicCell<usize> = AtomicCell::new(0);
const WAIT_TIMEOUT: Duration = Duration::from_millis(1000);
const EXPIRATION_PERIOD: Duration = Duration::from_secs(1);

/// Spawn a new I/O thread and return a handle for communicating with it.
///
/// The thread signals `wait_group` once it is up and running.
pub(crate) fn spawn(
    discovery: Arc<dyn ServiceDiscovery>,
    config: Arc<Config>,
    user_agent: String,
    space: Arc<Event>,
    wait_group: WaitGroup,
) -> io::Result<Handle> {
    let create_start = Instant::now();
    let id = NEXT_THREAD_ID.fetch_add(1);

    let selector = Selector::new()?;
    let waker = selector.waker();

    let (message_tx, message_rx) = async_channel::unbounded();
    let (intake_tx, intake_rx) = async_channel::bounded(config.max_queue_size);

    // The span of the thread outlives this call, but was caused by it.
    let span = tracing::debug_span!("io_thread", id);
    span.follows_from(tracing::Span::current());

    let thread_main = move || {
        let _enter = span.enter();

        let thread = IoThread::new(
            selector,
            Intake::new(intake_rx, space),
            message_rx,
            discovery,
            config,
            user_agent,
        );

        drop(wait_group);

        tracing::debug!("I/O thread took {:?} to start up", create_start.elapsed());

        let result = thread.run();

        if let Err(e) = &result {
            tracing::error!("I/O thread shut down with error: {}", e);
        }

        result
    };

    Ok(Handle {
        id,
        intake_tx,
        message_tx,
        waker,
        join_handle: Mutex::new(Some(
            thread::Builder::new()
                .name(format!("psg-io-{}", id))
                .spawn(thread_main)?,
        )),
    })
}

/// A handle to an I/O thread.
///
/// Dropping the handle asks the thread to shut down and waits for it.
#[derive(Debug)]
pub(crate) struct Handle {
    id: usize,

    /// New requests for the thread.
    intake_tx: Sender<Submission>,

    /// Used to send messages to the thread.
    message_tx: Sender<Message>,

    /// Interrupts the thread while it is polling.
    waker: Waker,

    join_handle: Mutex<Option<thread::JoinHandle<Result<(), Error>>>>,
}

/// A message sent to an I/O thread.
#[derive(Debug)]
enum Message {
    /// Requests the thread to stop once its requests in flight are done.
    Close,
}

#[derive(Debug)]
enum JoinResult {
    AlreadyJoined,
    Ok,
    Err(Error),
    Panic,
}

impl Handle {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Queue a request, without waiting for room.
    pub(crate) fn push(&self, submission: Submission) -> Result<(), TrySendError<Submission>> {
        self.intake_tx.try_send(submission)?;
        self.waker.wake_by_ref();
        Ok(())
    }

    /// Ask the thread to shut down without waiting for it.
    pub(crate) fn close(&self) {
        if self.message_tx.try_send(Message::Close).is_ok() {
            self.waker.wake_by_ref();
        }
    }

    fn try_join(&self) -> JoinResult {
        let mut option = lock(&self.join_handle);

        if let Some(join_handle) = option.take() {
            match join_handle.join() {
                Ok(Ok(())) => JoinResult::Ok,
                Ok(Err(e)) => JoinResult::Err(e),
                Err(_) => JoinResult::Panic,
            }
        } else {
            JoinResult::AlreadyJoined
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();

        match self.try_join() {
            JoinResult::Ok => tracing::trace!(id = self.id, "I/O thread joined cleanly"),
            JoinResult::Err(e) => tracing::error!("I/O thread terminated with error: {}", e),
            JoinResult::Panic => tracing::error!("I/O thread panicked"),
            JoinResult::AlreadyJoined => {}
        }
    }
}

struct Server {
    /// Whether the server was part of the service at the last discovery.
    /// Servers no longer discovered get no new requests but finish the ones
    /// they have.
    discovered: bool,
    session: IoSession,
}

/// State of an I/O thread.
struct IoThread {
    selector: Selector,
    intake: Intake,
    message_rx: Receiver<Message>,
    discovery: Arc<dyn ServiceDiscovery>,

    /// Servers by selector token.
    servers: Slab<Server>,

    /// The order in which servers are offered queued requests.
    order: Vec<usize>,

    rebalance: Interval,
    expiration: Interval,
    config: Arc<Config>,
    user_agent: String,
    close_requested: bool,
}

impl IoThread {
    fn new(
        selector: Selector,
        intake: Intake,
        message_rx: Receiver<Message>,
        discovery: Arc<dyn ServiceDiscovery>,
        config: Arc<Config>,
        user_agent: String,
    ) -> Self {
        Self {
            selector,
            intake,
            message_rx,
            discovery,
            servers: Slab::new(),
            order: Vec::new(),
            rebalance: Interval::new(Duration::ZERO, config.rebalance_time),
            expiration: Interval::new(EXPIRATION_PERIOD, EXPIRATION_PERIOD),
            config,
            user_agent,
            close_requested: false,
        }
    }

    /// Run the event loop until asked to stop and all requests in flight are
    /// done.
    fn run(mut self) -> Result<(), Error> {
        let result = self.run_loop();
        self.finish(result)
    }

    /// Fail everything still queued or in flight once the loop has ended.
    fn finish(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        let error = match &result {
            Ok(()) => {
                tracing::debug!("I/O thread shutting down");
                TransportError::Shutdown
            }
            Err(e) => TransportError::Internal(e.to_string()),
        };

        if !self.close_requested {
            self.close();
        }

        let mut io = Io {
            selector: &mut self.selector,
            intake: &mut self.intake,
        };

        for (_, server) in self.servers.iter_mut() {
            server.session.reset(&error, &mut io);
        }

        result
    }

    fn run_loop(&mut self) -> Result<(), Error> {
        loop {
            self.poll_messages();

            if self.close_requested && self.servers.iter().all(|(_, s)| s.session.is_idle()) {
                return Ok(());
            }

            self.poll()?;

            let now = Instant::now();

            if self.rebalance.tick(now) {
                self.rebalance();
            }

            if self.expiration.tick(now) {
                self.check_expiration();
            }

            self.process_queue();
        }
    }

    fn poll_messages(&mut self) {
        while !self.close_requested {
            match self.message_rx.try_recv() {
                Ok(Message::Close) => self.close(),
                Err(async_channel::TryRecvError::Empty) => break,
                Err(async_channel::TryRecvError::Closed) => {
                    tracing::warn!("I/O handle disconnected without close message");
                    self.close();
                }
            }
        }
    }

    fn close(&mut self) {
        self.close_requested = true;

        let remaining = self.intake.close();

        if !remaining.is_empty() {
            tracing::debug!(count = remaining.len(), "failing queued requests");
        }

        for submission in remaining {
            submission.fail(&TransportError::Shutdown);
        }
    }

    /// Block until socket activity, the next timer or a wakeup.
    fn poll(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        let timeout = self
            .rebalance
            .remaining(now)
            .min(self.expiration.remaining(now))
            .min(WAIT_TIMEOUT);

        if self.selector.poll(timeout)? {
            for (token, readable, writable) in self.selector.events() {
                tracing::trace!(token, readable, writable, "socket event");

                if let Some(server) = self.servers.get_mut(token) {
                    let mut io = Io {
                        selector: &mut self.selector,
                        intake: &mut self.intake,
                    };

                    guarded(&mut server.session, &mut io, |session, io| {
                        session.on_event(readable, writable, io)
                    });
                }
            }
        }

        Ok(())
    }

    /// Offer queued requests to the discovered servers, one after another.
    fn process_queue(&mut self) {
        if self.intake.is_empty() {
            return;
        }

        for i in 0..self.order.len() {
            let server = match self.servers.get_mut(self.order[i]) {
                Some(server) if server.discovered => server,
                _ => continue,
            };

            let mut io = Io {
                selector: &mut self.selector,
                intake: &mut self.intake,
            };

            if guarded(&mut server.session, &mut io, |session, io| {
                session.process_requests(io)
            }) {
                // Whoever took the last requests is offered the next ones last.
                if self.order.len() > 1 {
                    self.order.rotate_left(i + 1);
                }

                return;
            }
        }
    }

    fn rebalance(&mut self) {
        let mut discovered = match self.discovery.discover() {
            Ok(discovered) => discovered,
            Err(e) => {
                tracing::error!("service discovery failed: {}", e);
                return;
            }
        };

        discovered.sort_unstable();
        discovered.dedup();

        for (_, server) in self.servers.iter_mut() {
            let address = server.session.address();

            match discovered.iter().position(|a| *a == address) {
                Some(i) => {
                    discovered.swap_remove(i);

                    if !server.discovered {
                        tracing::debug!("host '{}' added to service", address);
                        server.discovered = true;
                    }
                }
                None => {
                    if server.discovered {
                        tracing::debug!("host '{}' removed from service", address);
                        server.discovered = false;
                    }
                }
            }
        }

        self.remove_stale_servers();

        for address in discovered {
            let entry = self.servers.vacant_entry();
            let token = entry.key();

            tracing::debug!("host '{}' added to service", address);

            entry.insert(Server {
                discovered: true,
                session: IoSession::new(token, address, &self.config, &self.user_agent),
            });
            self.order.push(token);
        }
    }

    /// Drop servers that left the service once nothing is in flight on them.
    fn remove_stale_servers(&mut self) {
        let stale: Vec<usize> = self
            .servers
            .iter()
            .filter(|(_, s)| !s.discovered && s.session.is_idle())
            .map(|(token, _)| token)
            .collect();

        let mut io = Io {
            selector: &mut self.selector,
            intake: &mut self.intake,
        };

        for token in stale {
            let mut server = self.servers.remove(token);

            tracing::debug!("host '{}' dropped", server.session.address());
            server.session.reset(&TransportError::SessionClosed, &mut io);
            self.order.retain(|t| *t != token);
        }
    }

    /// Once a second: expire requests in flight, and give queued requests a
    /// step closer to failing if there is nowhere to send them.
    fn check_expiration(&mut self) {
        let mut io = Io {
            selector: &mut self.selector,
            intake: &mut self.intake,
        };

        for (_, server) in self.servers.iter_mut() {
            guarded(&mut server.session, &mut io, |session, io| {
                session.check_request_expiration(io)
            });
        }

        if self.servers.iter().any(|(_, s)| s.discovered) {
            return;
        }

        let mut queued = Vec::new();

        while let Some(submission) = io.intake.pop() {
            queued.push(submission);
        }

        for submission in queued {
            retry(submission, &TransportError::NoServers, io.intake);
        }
    }
}

/// Call into a session, resetting it if the call panics.
fn guarded<T: Default>(
    session: &mut IoSession,
    io: &mut Io<'_>,
    f: impl FnOnce(&mut IoSession, &mut Io<'_>) -> T,
) -> T {
    match catch_unwind(AssertUnwindSafe(|| f(session, io))) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!(address = %session.address(), "session panicked");
            session.reset(&TransportError::Internal("session panicked".into()), io);
            T::default()
        }
    }
}
