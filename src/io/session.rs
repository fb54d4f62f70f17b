//! A session with one server, and the retry policy for its requests.

use super::{http2::Http2Session, http2::StreamEvent, intake::Intake, selector::Selector, tcp};
use crate::{config::Config, error::TransportError, reply::Status, request::Submission};
use std::{collections::HashMap, io, mem, net::SocketAddr};

/// What a session gets to work with when called by its I/O thread.
pub(crate) struct Io<'a> {
    pub(crate) selector: &'a mut Selector,
    pub(crate) intake: &'a mut Intake,
}

struct InFlight {
    submission: Submission,
    /// Whole seconds since the request was submitted.
    seconds: u32,
}

/// Send a request again if its retry budget allows, otherwise fail it.
///
/// Returns `true` if the request was queued for another attempt.
pub(crate) fn retry(mut submission: Submission, error: &TransportError, intake: &mut Intake) -> bool {
    if let Some(remaining) = submission.take_retry() {
        submission.debug.retrying(remaining, error);

        match intake.push(submission) {
            Ok(()) => return true,
            Err(rejected) => submission = rejected,
        }
    }

    submission.fail(error);
    false
}

/// One HTTP/2 session over one TCP connection to one server, together with
/// the requests in flight on it.
pub(crate) struct IoSession {
    http2: Http2Session,
    tcp: tcp::TcpConnection,
    requests: HashMap<u32, InFlight>,
    request_timeout: u32,
    reader_timeout: u32,
    /// Whole seconds since anything was received while requests were in
    /// flight.
    idle_seconds: u32,
    read_buf: Vec<u8>,
}

impl IoSession {
    pub(crate) fn new(token: usize, address: SocketAddr, config: &Config, user_agent: &str) -> Self {
        Self {
            http2: Http2Session::new(
                address.to_string(),
                user_agent.to_owned(),
                config.max_concurrent_streams,
            ),
            tcp: tcp::TcpConnection::new(token, address, config.write_hiwater),
            requests: HashMap::new(),
            request_timeout: config.request_timeout,
            reader_timeout: config.reader_timeout,
            idle_seconds: 0,
            read_buf: vec![0; config.rd_buf_size],
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.tcp.address()
    }

    /// Whether the session has no requests in flight.
    pub(crate) fn is_idle(&self) -> bool {
        self.requests.is_empty()
    }

    /// Submit queued requests while there is room for more streams.
    ///
    /// Returns `true` if the queue was emptied, `false` if the session ran
    /// out of room or failed.
    pub(crate) fn process_requests(&mut self, io: &mut Io<'_>) -> bool {
        while self.requests.len() < self.http2.max_streams() && self.http2.is_ready() {
            let mut submission = match io.intake.pop() {
                Some(submission) => submission,
                None => return true,
            };

            submission.restart();

            match self.http2.submit(&submission) {
                Ok(stream_id) => {
                    self.requests.insert(
                        stream_id,
                        InFlight {
                            submission,
                            seconds: 0,
                        },
                    );

                    if !self.send(io) {
                        return false;
                    }
                }
                Err(error) => {
                    retry(submission, &error, io.intake);
                    self.reset(&error, io);
                    return false;
                }
            }
        }

        false
    }

    /// Handle readiness of the session's socket.
    pub(crate) fn on_event(&mut self, readable: bool, writable: bool, io: &mut Io<'_>) {
        match self.tcp.state() {
            tcp::State::Connecting => {
                if let Err(error) = self.tcp.on_connect(io.selector) {
                    self.reset(&error, io);
                }
            }
            tcp::State::Connected => {
                if writable {
                    if let Err(error) = self.tcp.on_writable(io.selector) {
                        self.reset(&error, io);
                        return;
                    }
                }

                if readable {
                    self.on_readable(io);
                }
            }
            tcp::State::Closing | tcp::State::Closed => {}
        }
    }

    fn on_readable(&mut self, io: &mut Io<'_>) {
        let mut buf = mem::take(&mut self.read_buf);

        while self.tcp.state() == tcp::State::Connected {
            match self.tcp.read(&mut buf) {
                Ok(0) => self.reset(&TransportError::Disconnected, io),
                Ok(n) => {
                    self.idle_seconds = 0;
                    self.on_read(&buf[..n], io);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => self.reset(&TransportError::Read(e), io),
            }
        }

        self.read_buf = buf;
    }

    fn on_read(&mut self, data: &[u8], io: &mut Io<'_>) {
        let events = match self.http2.recv(data) {
            Ok(events) => events,
            Err(error) => {
                self.reset(&error, io);
                return;
            }
        };

        for event in events {
            match event {
                StreamEvent::Header { stream_id, status } => {
                    tracing::trace!(stream_id, status, "response status");

                    if let Some(request) = self.requests.get(&stream_id) {
                        let reply = &request.submission.reply;

                        if status == 404 {
                            reply.set_status(Status::NotFound);
                        } else if status != 200 {
                            let reason = http::StatusCode::from_u16(status)
                                .ok()
                                .and_then(|status| status.canonical_reason())
                                .unwrap_or("Unknown");

                            reply.add_error(format!("{} {}", status, reason));
                        }
                    }
                }
                StreamEvent::Data { stream_id, data } => match self.requests.get_mut(&stream_id) {
                    Some(request) => request.submission.on_data(&data),
                    None => tracing::warn!(stream_id, len = data.len(), "data for unknown stream"),
                },
                StreamEvent::Close {
                    stream_id,
                    error_code,
                } => {
                    if let Some(request) = self.requests.remove(&stream_id) {
                        let submission = request.submission;
                        submission.debug.closed(error_code);

                        if error_code == 0 {
                            submission.reply.set_success();
                        } else {
                            let error = TransportError::StreamClosed(error_code.into());

                            if !retry(submission, &error, io.intake) {
                                tracing::error!("request failed with {}", error);
                            }
                        }
                    }
                }
            }
        }

        self.send(io);
    }

    /// Pass whatever the HTTP/2 session wants to send on to the connection.
    fn send(&mut self, io: &mut Io<'_>) -> bool {
        match self.http2.send(self.tcp.write_buffer()) {
            Ok(0) => true,
            Ok(_) => match self.tcp.write(io.selector) {
                Ok(()) => true,
                Err(error) => {
                    self.reset(&error, io);
                    false
                }
            },
            Err(error) => {
                self.reset(&error, io);
                false
            }
        }
    }

    /// Advance the clock of every request in flight by a second, giving up
    /// on those that took too long. Called once a second.
    pub(crate) fn check_request_expiration(&mut self, io: &mut Io<'_>) {
        let timeout = self.request_timeout;
        let mut expired = Vec::new();

        for (&stream_id, request) in self.requests.iter_mut() {
            request.seconds += 1;

            if request.seconds >= timeout {
                expired.push(stream_id);
            }
        }

        for stream_id in expired {
            if let Some(request) = self.requests.remove(&stream_id) {
                tracing::debug!(stream_id, "request expired");
                retry(request.submission, &TransportError::Timeout, io.intake);
            }
        }

        if self.requests.is_empty() {
            self.idle_seconds = 0;
        } else {
            self.idle_seconds += 1;

            if self.reader_timeout > 0 && self.idle_seconds >= self.reader_timeout {
                self.reset(&TransportError::ReadTimeout, io);
            }
        }
    }

    /// Tear down the connection and retry every request in flight. Resetting
    /// a session that has already been reset does nothing more.
    pub(crate) fn reset(&mut self, error: &TransportError, io: &mut Io<'_>) {
        tracing::debug!(authority = self.http2.authority(), "resetting with {}", error);

        let last = self.http2.del();

        if self.tcp.state() == tcp::State::Connected && !last.is_empty() {
            self.tcp.write_buffer().extend_from_slice(&last);

            if let Err(e) = self.tcp.write(io.selector) {
                tracing::debug!("failed to say goodbye: {}", e);
            }
        }

        self.tcp.close(io.selector);
        self.idle_seconds = 0;

        let mut some_failed = false;

        for (_, request) in self.requests.drain() {
            if !retry(request.submission, error, io.intake) {
                some_failed = true;
            }
        }

        if some_failed {
            tracing::error!("some requests failed with {}", error);
        }
    }
}
