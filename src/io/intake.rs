use crate::request::Submission;
use async_channel::Receiver;
use event_listener::Event;
use std::{collections::VecDeque, sync::Arc};

/// The receiving end of an I/O thread's request queue.
///
/// New requests arrive from other threads through a bounded channel. Requests
/// being retried are pushed back locally by the I/O thread itself and are
/// picked up before new ones.
#[derive(Debug)]
pub(crate) struct Intake {
    retries: VecDeque<Submission>,
    rx: Receiver<Submission>,
    space: Arc<Event>,
    closed: bool,
}

impl Intake {
    /// `space` is notified every time a request is taken off the channel.
    pub(crate) fn new(rx: Receiver<Submission>, space: Arc<Event>) -> Self {
        Self {
            retries: VecDeque::new(),
            rx,
            space,
            closed: false,
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Submission> {
        if let Some(submission) = self.retries.pop_front() {
            return Some(submission);
        }

        let submission = self.rx.try_recv().ok()?;
        self.space.notify_additional(1);

        Some(submission)
    }

    /// Queue a request for another attempt. Fails once the intake is closed.
    pub(crate) fn push(&mut self, submission: Submission) -> Result<(), Submission> {
        if self.closed {
            return Err(submission);
        }

        self.retries.push_back(submission);
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.retries.is_empty() && self.rx.is_empty()
    }

    /// Stop accepting requests and hand back everything still queued.
    pub(crate) fn close(&mut self) -> Vec<Submission> {
        self.closed = true;
        self.rx.close();

        let mut remaining: Vec<_> = self.retries.drain(..).collect();

        while let Ok(submission) = self.rx.try_recv() {
            remaining.push(submission);
        }

        self.space.notify_additional(usize::MAX);

        remaining
    }
}
