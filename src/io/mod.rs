//! The I/O layer: a pool of I/O threads sharing the load of one service.
//!
//! Each I/O thread drives HTTP/2 sessions to all servers of the service from
//! a single event loop. Requests are handed to the threads in runs of
//! `requests_per_io` consecutive requests per thread. A thread whose queue is
//! full is skipped, and if every queue is full the caller waits for room
//! until its deadline.

use crate::{
    config::Config, context::DiagContext, deadline::Deadline, discovery::ServiceDiscovery,
    error::Error, request::Submission,
};
use async_channel::TrySendError;
use crossbeam_utils::sync::WaitGroup;
use event_listener::Event;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

mod http2;
mod intake;
mod selector;
mod session;
mod tcp;
mod thread;
mod timer;
mod write;

/// A pool of I/O threads serving one service.
///
/// A coordinator can be shared by any number of queues. Dropping the last
/// reference stops the threads: requests still queued fail right away, while
/// requests in flight are given the chance to complete.
pub struct IoCoordinator {
    threads: Vec<thread::Handle>,
    counter: AtomicUsize,
    requests_per_io: usize,

    /// Notified whenever a request leaves an intake queue.
    space: Arc<Event>,

    config: Arc<Config>,
    diag: Arc<DiagContext>,
}

impl IoCoordinator {
    /// Start the I/O threads for a service.
    pub fn new(
        discovery: impl ServiceDiscovery,
        config: Config,
        diag: DiagContext,
    ) -> Result<Self, Error> {
        let create_start = Instant::now();
        let discovery: Arc<dyn ServiceDiscovery> = Arc::new(discovery);
        let config = Arc::new(config);
        let space = Arc::new(Event::new());

        let wait_group = WaitGroup::new();
        let mut threads = Vec::with_capacity(config.num_io);

        for _ in 0..config.num_io.max(1) {
            threads.push(thread::spawn(
                discovery.clone(),
                config.clone(),
                diag.user_agent().to_owned(),
                space.clone(),
                wait_group.clone(),
            )?);
        }

        // Block until every thread is up.
        wait_group.wait();

        tracing::debug!(
            threads = threads.len(),
            "I/O coordinator took {:?} to start up",
            create_start.elapsed()
        );

        Ok(Self {
            threads,
            counter: AtomicUsize::new(0),
            requests_per_io: config.requests_per_io.max(1),
            space,
            config,
            diag: Arc::new(diag),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn diag_context(&self) -> &DiagContext {
        &self.diag
    }

    /// Hand a request to one of the I/O threads, waiting for room until
    /// `deadline` if all of them are full.
    ///
    /// Waiting is abandoned as soon as `stopped` is set; whoever sets it must
    /// call [`IoCoordinator::wake_waiters`] afterwards.
    pub(crate) fn add_request(
        &self,
        mut submission: Submission,
        deadline: Deadline,
        stopped: &AtomicBool,
    ) -> Result<(), Error> {
        let n = self.threads.len();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let first = (counter / self.requests_per_io) % n;
        let mut moved_on = false;

        loop {
            if stopped.load(Ordering::Acquire) {
                return Err(Error::Stopped);
            }

            // Listen before trying, so that room made in between is not
            // missed.
            let listener = self.space.listen();
            let mut terminated = 0;

            for i in 0..n {
                let handle = &self.threads[(first + i) % n];

                match handle.push(submission) {
                    Ok(()) => {
                        tracing::trace!(thread = handle.id(), "request queued");
                        return Ok(());
                    }
                    Err(TrySendError::Full(rejected)) => submission = rejected,
                    Err(TrySendError::Closed(rejected)) => {
                        submission = rejected;
                        terminated += 1;
                    }
                }

                // Let the requests that follow start with the next thread
                // instead of the one that is full.
                if !moved_on {
                    moved_on = true;
                    let _ = self.counter.compare_exchange(
                        counter.wrapping_add(1),
                        counter.wrapping_add(1 + self.requests_per_io),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                }
            }

            if terminated == n {
                return Err(Error::IoThreadTerminated);
            }

            if !deadline.wait(listener) && deadline.is_expired() {
                return Err(Error::QueueFull);
            }
        }
    }

    /// Wake up everyone waiting for room in an intake queue.
    pub(crate) fn wake_waiters(&self) {
        self.space.notify(usize::MAX);
    }
}

impl fmt::Debug for IoCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoCoordinator")
            .field("threads", &self.threads.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for IoCoordinator {
    fn drop(&mut self) {
        // Let all threads wind down at the same time before joining any.
        for handle in &self.threads {
            handle.close();
        }

        self.threads.clear();
    }
}
