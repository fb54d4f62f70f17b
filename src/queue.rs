//! The user facing request queue and its callback driven variant.

use crate::{
    config::Config,
    context::DiagContext,
    deadline::Deadline,
    discovery::{ServiceDiscovery, ServiceList},
    error::Error,
    io::IoCoordinator,
    reply::{Item, NextItem, Reply, Status},
    request::Request,
};
use async_channel::{Receiver, Sender};
use event_listener::Event;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Builder for a [`Queue`] with its own I/O threads.
pub struct QueueBuilder<D> {
    discovery: D,
    config: Config,
    diag: DiagContext,
}

impl<D: ServiceDiscovery> QueueBuilder<D> {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn diag_context(mut self, diag: DiagContext) -> Self {
        self.diag = diag;
        self
    }

    /// Start the I/O threads and create the queue.
    pub fn build(self) -> Result<Queue, Error> {
        let coordinator = IoCoordinator::new(self.discovery, self.config, self.diag)?;

        Ok(Queue::with_coordinator(Arc::new(coordinator)))
    }
}

/// A queue of requests to one service.
///
/// Requests are sent with [`Queue::send_request`]; their replies are then
/// picked up in the order the requests were sent with [`Queue::next_reply`].
/// Any number of threads can use a queue at the same time.
pub struct Queue {
    coordinator: Arc<IoCoordinator>,
    replies_tx: Sender<Reply>,
    replies_rx: Receiver<Reply>,
    stopped: AtomicBool,

    /// Notified on every change of any reply of this queue.
    signal: Arc<Event>,
}

impl Queue {
    /// Create a queue for a comma separated list of `host:port` servers, with
    /// configuration taken from the environment.
    pub fn new(service: &str) -> Result<Self, Error> {
        Self::builder(ServiceList::parse(service)?)
            .config(Config::from_env()?)
            .build()
    }

    pub fn builder<D: ServiceDiscovery>(discovery: D) -> QueueBuilder<D> {
        QueueBuilder {
            discovery,
            config: Config::default(),
            diag: DiagContext::default(),
        }
    }

    /// Create a queue sharing the I/O threads of other queues.
    pub fn with_coordinator(coordinator: Arc<IoCoordinator>) -> Self {
        let (replies_tx, replies_rx) = async_channel::unbounded();

        Self {
            coordinator,
            replies_tx,
            replies_rx,
            stopped: AtomicBool::new(false),
            signal: Arc::new(Event::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<IoCoordinator> {
        &self.coordinator
    }

    /// Send a request. Its reply is handed out by [`Queue::next_reply`].
    ///
    /// Blocks until there is room for the request or `deadline` expires.
    pub fn send_request(&self, request: Request, deadline: impl Into<Deadline>) -> Result<(), Error> {
        let reply = self.submit(request, deadline.into())?;

        // The receiver lives as long as the queue.
        let _ = self.replies_tx.try_send(reply);
        self.signal.notify(usize::MAX);

        Ok(())
    }

    /// Send a request and get its reply right away. The reply is not handed
    /// out by [`Queue::next_reply`].
    pub fn send_request_and_get_reply(
        &self,
        request: Request,
        deadline: impl Into<Deadline>,
    ) -> Result<Reply, Error> {
        self.submit(request, deadline.into())
    }

    fn submit(&self, request: Request, deadline: Deadline) -> Result<Reply, Error> {
        let submission = request.into_submission(
            self.coordinator.config(),
            self.coordinator.diag_context(),
            Some(self.signal.clone()),
        );
        let reply = Reply::new(submission.reply.clone());

        self.coordinator
            .add_request(submission, deadline, &self.stopped)?;

        Ok(reply)
    }

    /// Wait for the reply of the next request sent with
    /// [`Queue::send_request`]. Returns `None` if `deadline` expires first or
    /// the queue is stopped with no replies left.
    pub fn next_reply(&self, deadline: impl Into<Deadline>) -> Option<Reply> {
        let deadline = deadline.into();

        loop {
            let listener = self.signal.listen();

            if let Ok(reply) = self.replies_rx.try_recv() {
                return Some(reply);
            }

            if self.is_stopped() || !deadline.wait(listener) {
                return None;
            }
        }
    }

    /// Asynchronous variant of [`Queue::next_reply`] without a deadline.
    pub async fn next_reply_async(&self) -> Option<Reply> {
        if self.is_stopped() {
            return self.replies_rx.try_recv().ok();
        }

        self.replies_rx.recv().await.ok()
    }

    /// Stop the queue. Sending blocked on a full queue gives up, and no new
    /// requests are accepted. Requests already sent are not affected.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.coordinator.wake_waiters();
        self.signal.notify(usize::MAX);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether there are no replies waiting to be picked up.
    pub fn is_empty(&self) -> bool {
        self.replies_rx.is_empty()
    }

    fn try_next_reply(&self) -> Option<Reply> {
        self.replies_rx.try_recv().ok()
    }
}

impl<D> fmt::Debug for QueueBuilder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBuilder")
            .field("config", &self.config)
            .field("diag", &self.diag)
            .finish()
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("replies", &self.replies_rx.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Progress of one reply followed by an [`EventLoop`].
struct Tracked {
    reply: Reply,
    items: Vec<Item>,
    reported: usize,
}

impl Tracked {
    fn new(reply: Reply) -> Self {
        Self {
            reply,
            items: Vec::new(),
            reported: 0,
        }
    }

    /// Report items that completed, in the order they appeared, and then the
    /// reply. Returns whether anything was reported, and whether the reply
    /// itself was.
    fn poll(
        &mut self,
        item_complete: &mut impl FnMut(Status, &Item),
        reply_complete: &mut impl FnMut(Status, &Reply),
    ) -> (bool, bool) {
        // Read before collecting items, so no item can show up after a
        // complete status was seen.
        let status = self.reply.current_status();

        while let NextItem::Item(item) = self.reply.next_item(Deadline::now()) {
            self.items.push(item);
        }

        let mut progressed = false;

        while let Some(item) = self.items.get(self.reported) {
            let item_status = item.current_status();

            if !item_status.is_complete() {
                break;
            }

            item_complete(item_status, item);
            self.reported += 1;
            progressed = true;
        }

        if status.is_complete() && self.reported == self.items.len() {
            reply_complete(status, &self.reply);
            return (true, true);
        }

        (progressed, false)
    }
}

/// Callback driven use of a [`Queue`].
///
/// Every reply of the queue is followed until it completes: `item_complete`
/// is called once for each of its items when the item completes, and then
/// `reply_complete` once for the reply. Callbacks are only ever called from
/// within [`EventLoop::run_once`].
pub struct EventLoop<I, R> {
    queue: Queue,
    item_complete: I,
    reply_complete: R,
    replies: Vec<Tracked>,
}

impl<I, R> EventLoop<I, R>
where
    I: FnMut(Status, &Item),
    R: FnMut(Status, &Reply),
{
    pub fn new(queue: Queue, item_complete: I, reply_complete: R) -> Self {
        Self {
            queue,
            item_complete,
            reply_complete,
            replies: Vec::new(),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn send_request(&self, request: Request, deadline: impl Into<Deadline>) -> Result<(), Error> {
        self.queue.send_request(request, deadline)
    }

    /// Wait until at least one callback was called or `deadline` expires.
    ///
    /// Returns `false` once the queue is stopped and every reply has been
    /// reported.
    pub fn run_once(&mut self, deadline: impl Into<Deadline>) -> bool {
        let deadline = deadline.into();

        loop {
            let listener = self.queue.signal.listen();

            while let Some(reply) = self.queue.try_next_reply() {
                self.replies.push(Tracked::new(reply));
            }

            let mut progressed = false;
            let item_complete = &mut self.item_complete;
            let reply_complete = &mut self.reply_complete;

            self.replies.retain_mut(|tracked| {
                let (reported, done) = tracked.poll(&mut *item_complete, &mut *reply_complete);
                progressed |= reported;
                !done
            });

            if self.queue.is_stopped() && self.replies.is_empty() && self.queue.is_empty() {
                return false;
            }

            if progressed || !deadline.wait(listener) {
                return true;
            }
        }
    }

    /// Stop the underlying queue.
    pub fn stop(&self) {
        self.queue.stop();
    }
}

impl<I, R> fmt::Debug for EventLoop<I, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("queue", &self.queue)
            .field("replies", &self.replies.len())
            .finish()
    }
}
