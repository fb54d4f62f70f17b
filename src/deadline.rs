use event_listener::EventListener;
use std::time::{Duration, Instant};

/// A point in time after which a blocking call gives up waiting.
///
/// Every blocking method in this crate takes `impl Into<Deadline>`, so a
/// [`Duration`] (relative to now), an [`Instant`] or [`Deadline::infinite`]
/// can be passed directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    pub const fn infinite() -> Self {
        Deadline(None)
    }

    /// A deadline that has already expired. Blocking calls given this
    /// deadline only check the current state and return immediately.
    pub fn now() -> Self {
        Deadline(Some(Instant::now()))
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now().checked_add(timeout))
    }

    /// Get the instant of this deadline, or `None` if infinite.
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    pub fn is_expired(&self) -> bool {
        self.0.map(|at| Instant::now() >= at).unwrap_or(false)
    }

    /// Time left until the deadline, or `None` if infinite.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Block on a listener until it is notified or the deadline expires.
    ///
    /// Returns `true` if the listener was notified.
    pub(crate) fn wait(&self, listener: EventListener) -> bool {
        match self.0 {
            Some(at) => listener.wait_deadline(at),
            None => {
                listener.wait();
                true
            }
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::infinite()
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Deadline::after(timeout)
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline(Some(at))
    }
}

impl From<Option<Instant>> for Deadline {
    fn from(at: Option<Instant>) -> Self {
        Deadline(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_listener::Event;

    #[test]
    fn infinite_never_expires() {
        let deadline = Deadline::infinite();

        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), None);
    }

    #[test]
    fn wait_times_out_without_notification() {
        let event = Event::new();
        let deadline = Deadline::after(Duration::from_millis(20));

        assert!(!deadline.wait(event.listen()));
        assert!(deadline.is_expired());
    }

    #[test]
    fn wait_returns_when_notified() {
        let event = Event::new();
        let listener = event.listen();
        event.notify(1);

        assert!(Deadline::after(Duration::from_secs(5)).wait(listener));
    }
}
