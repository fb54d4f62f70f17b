//! HTTP/2 session over an in-memory transport.
//!
//! The session never touches a socket. Bytes received from the network are
//! handed in with [`Http2Session::recv`], which reports what happened on each
//! stream, and bytes to send are taken out with [`Http2Session::send`]. The
//! `h2` futures underneath are polled by hand with a no-op waker; they make
//! progress whenever new input arrives or new output is requested.

use crate::{error::TransportError, request::Submission};
use bytes::{Bytes, BytesMut};
use h2::{
    client::{self, Connection, ResponseFuture, SendRequest},
    Reason, RecvStream,
};
use std::{
    cell::RefCell,
    collections::HashMap,
    future::Future,
    io,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Default)]
struct Buffers {
    incoming: BytesMut,
    outgoing: Vec<u8>,
}

/// Byte pipe between the session and the HTTP/2 engine.
#[derive(Clone, Debug, Default)]
struct Transport(Rc<RefCell<Buffers>>);

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut buffers = self.0.borrow_mut();

        if buffers.incoming.is_empty() {
            return Poll::Pending;
        }

        let len = buf.remaining().min(buffers.incoming.len());
        buf.put_slice(&buffers.incoming.split_to(len));

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.borrow_mut().outgoing.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Something that happened on a stream.
#[derive(Debug, PartialEq)]
pub(crate) enum StreamEvent {
    /// The response headers arrived.
    Header { stream_id: u32, status: u16 },
    /// A piece of the response body arrived.
    Data { stream_id: u32, data: Bytes },
    /// The stream is closed, normally if `error_code` is zero.
    Close { stream_id: u32, error_code: u32 },
}

enum Stream {
    Waiting(ResponseFuture),
    Receiving(RecvStream),
}

struct Inner {
    transport: Transport,
    connection: Pin<Box<Connection<Transport, Bytes>>>,
    send_request: SendRequest<Bytes>,
    streams: HashMap<u32, Stream>,
    finished: bool,
}

/// One HTTP/2 client session.
///
/// The underlying connection state is created lazily and dropped by
/// [`Http2Session::del`], after which the session starts over.
pub(crate) struct Http2Session {
    authority: String,
    user_agent: String,
    max_concurrent_streams: u32,
    inner: Option<Inner>,
    waker: Waker,
}

impl Http2Session {
    pub(crate) fn new(authority: String, user_agent: String, max_concurrent_streams: u32) -> Self {
        Self {
            authority,
            user_agent,
            max_concurrent_streams,
            inner: None,
            waker: waker_fn::waker_fn(|| {}),
        }
    }

    pub(crate) fn authority(&self) -> &str {
        &self.authority
    }

    fn init(&mut self) -> Result<&mut Inner, TransportError> {
        if self.inner.is_none() {
            let transport = Transport::default();
            let mut handshake = Box::pin(
                client::Builder::new()
                    .max_concurrent_streams(self.max_concurrent_streams)
                    .handshake::<_, Bytes>(transport.clone()),
            );

            let mut cx = Context::from_waker(&self.waker);

            let (send_request, connection) = match handshake.as_mut().poll(&mut cx) {
                Poll::Ready(result) => result?,
                Poll::Pending => {
                    return Err(TransportError::Internal("HTTP/2 handshake stalled".into()))
                }
            };

            tracing::trace!(authority = %self.authority, "HTTP/2 session created");

            self.inner = Some(Inner {
                transport,
                connection: Box::pin(connection),
                send_request,
                streams: HashMap::new(),
                finished: false,
            });
        }

        match self.inner.as_mut() {
            Some(inner) => Ok(inner),
            None => Err(TransportError::SessionClosed),
        }
    }

    /// Maximum number of concurrent streams: the smaller of the local limit
    /// and the limit advertised by the server.
    pub(crate) fn max_streams(&self) -> usize {
        let local = self.max_concurrent_streams as usize;

        match self.inner.as_ref() {
            Some(inner) => inner.connection.max_concurrent_send_streams().min(local),
            None => local,
        }
    }

    /// Whether a new stream can be opened right now.
    pub(crate) fn is_ready(&mut self) -> bool {
        let mut cx = Context::from_waker(&self.waker);

        match self.inner.as_mut() {
            Some(inner) => !inner.finished && inner.send_request.poll_ready(&mut cx).is_ready(),
            None => true,
        }
    }

    /// Open a stream for a request. Returns the id of the new stream.
    pub(crate) fn submit(&mut self, submission: &Submission) -> Result<u32, TransportError> {
        let uri = format!("http://{}{}", self.authority, submission.full_path);
        let context = &submission.context;

        let mut builder = http::Request::get(uri)
            .header(http::header::USER_AGENT, self.user_agent.as_str())
            .header("http_ncbi_sid", context.session_id())
            .header("http_ncbi_phid", context.next_sub_hit_id());

        if let Some(ip) = context.client_ip() {
            builder = builder.header("x-forwarded-for", ip.to_string());
        }

        let request = builder.body(())?;
        let inner = self.init()?;

        if inner.finished {
            return Err(TransportError::SessionClosed);
        }

        let (response, _) = inner.send_request.send_request(request, true)?;
        let stream_id = response.stream_id().as_u32();

        inner.streams.insert(stream_id, Stream::Waiting(response));

        tracing::trace!(stream_id, "submitted");
        submission.debug.submitted(&self.authority, &submission.full_path);

        Ok(stream_id)
    }

    /// Move everything the session wants to send into `buf`. Returns the
    /// number of bytes added.
    pub(crate) fn send(&mut self, buf: &mut Vec<u8>) -> Result<usize, TransportError> {
        let waker = self.waker.clone();
        let inner = self.init()?;

        if inner.finished {
            return Err(TransportError::SessionClosed);
        }

        inner.drive(&waker)?;

        let mut buffers = inner.transport.0.borrow_mut();
        let len = buffers.outgoing.len();
        buf.append(&mut buffers.outgoing);

        if len > 0 {
            tracing::trace!(len, "sending");
        }

        Ok(len)
    }

    /// Feed bytes received from the network and collect the resulting stream
    /// events.
    pub(crate) fn recv(&mut self, data: &[u8]) -> Result<Vec<StreamEvent>, TransportError> {
        let waker = self.waker.clone();
        let inner = self.init()?;

        inner.transport.0.borrow_mut().incoming.extend_from_slice(data);
        tracing::trace!(len = data.len(), "received");

        inner.drive(&waker)?;

        let mut events = Vec::new();
        let mut cx = Context::from_waker(&waker);

        inner
            .streams
            .retain(|&stream_id, stream| poll_stream(stream_id, stream, &mut cx, &mut events));

        // Let window updates for the data just consumed go out.
        inner.drive(&waker)?;

        Ok(events)
    }

    /// Tear the session down and return the last bytes to send: resets of
    /// the streams still open and a `GOAWAY`, written once the connection is
    /// left without streams or handles. Does nothing if there is no session.
    pub(crate) fn del(&mut self) -> Vec<u8> {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return Vec::new(),
        };

        tracing::trace!(
            authority = %self.authority,
            streams = inner.streams.len(),
            "HTTP/2 session deleted"
        );

        let Inner {
            transport,
            mut connection,
            send_request,
            streams,
            finished,
        } = inner;

        drop(streams);
        drop(send_request);

        if !finished {
            let mut cx = Context::from_waker(&self.waker);

            if let Poll::Ready(Err(e)) = connection.as_mut().poll(&mut cx) {
                tracing::debug!("HTTP/2 connection ended with {}", e);
            }
        }

        drop(connection);

        let outgoing = std::mem::take(&mut transport.0.borrow_mut().outgoing);
        outgoing
    }
}

impl Inner {
    fn drive(&mut self, waker: &Waker) -> Result<(), TransportError> {
        if self.finished {
            return Ok(());
        }

        let mut cx = Context::from_waker(waker);

        match self.connection.as_mut().poll(&mut cx) {
            Poll::Pending => Ok(()),
            Poll::Ready(Ok(())) => {
                tracing::debug!("HTTP/2 connection finished");
                self.finished = true;
                Ok(())
            }
            Poll::Ready(Err(e)) => Err(e.into()),
        }
    }
}

/// Poll one stream for new events. Returns `false` once the stream is
/// closed.
fn poll_stream(
    stream_id: u32,
    stream: &mut Stream,
    cx: &mut Context<'_>,
    events: &mut Vec<StreamEvent>,
) -> bool {
    if let Stream::Waiting(response) = stream {
        match Pin::new(response).poll(cx) {
            Poll::Pending => return true,
            Poll::Ready(Ok(response)) => {
                events.push(StreamEvent::Header {
                    stream_id,
                    status: response.status().as_u16(),
                });
                *stream = Stream::Receiving(response.into_body());
            }
            Poll::Ready(Err(e)) => {
                events.push(StreamEvent::Close {
                    stream_id,
                    error_code: error_code(&e),
                });
                return false;
            }
        }
    }

    if let Stream::Receiving(body) = stream {
        loop {
            match body.poll_data(cx) {
                Poll::Pending => return true,
                Poll::Ready(Some(Ok(data))) => {
                    if let Err(e) = body.flow_control().release_capacity(data.len()) {
                        tracing::debug!(stream_id, "failed to release capacity: {}", e);
                    }
                    events.push(StreamEvent::Data { stream_id, data });
                }
                Poll::Ready(Some(Err(e))) => {
                    events.push(StreamEvent::Close {
                        stream_id,
                        error_code: error_code(&e),
                    });
                    return false;
                }
                Poll::Ready(None) => {
                    events.push(StreamEvent::Close {
                        stream_id,
                        error_code: 0,
                    });
                    return false;
                }
            }
        }
    }

    true
}

fn error_code(error: &h2::Error) -> u32 {
    error
        .reason()
        .unwrap_or(Reason::INTERNAL_ERROR)
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::tests::submission;

    const SERVER_SETTINGS: &[u8] = &[0, 0, 0, 4, 0, 0, 0, 0, 0];

    fn session() -> Http2Session {
        Http2Session::new("127.0.0.1:2180".into(), "test/1.0".into(), 100)
    }

    #[test]
    fn first_send_writes_preface() {
        let mut session = session();
        let mut buf = Vec::new();

        assert!(session.send(&mut buf).unwrap() > 0);
        assert!(buf.starts_with(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"));

        buf.clear();
        assert_eq!(session.send(&mut buf).unwrap(), 0);
    }

    #[test]
    fn stream_ids_are_odd_and_increasing() {
        let mut session = session();

        assert_eq!(session.submit(&submission(0)).unwrap(), 1);
        assert_eq!(session.submit(&submission(0)).unwrap(), 3);
    }

    #[test]
    fn response_is_reported_as_events() {
        let mut session = session();
        let mut buf = Vec::new();

        let stream_id = session.submit(&submission(0)).unwrap();
        session.send(&mut buf).unwrap();

        let mut input = SERVER_SETTINGS.to_vec();
        // HEADERS, END_HEADERS, ":status: 200" from the static table
        input.extend_from_slice(&[0, 0, 1, 1, 4, 0, 0, 0, 1, 0x88]);
        // DATA, END_STREAM
        input.extend_from_slice(&[0, 0, 5, 0, 1, 0, 0, 0, 1]);
        input.extend_from_slice(b"hello");

        assert_eq!(
            session.recv(&input).unwrap(),
            [
                StreamEvent::Header {
                    stream_id,
                    status: 200
                },
                StreamEvent::Data {
                    stream_id,
                    data: Bytes::from_static(b"hello")
                },
                StreamEvent::Close {
                    stream_id,
                    error_code: 0
                },
            ]
        );
    }

    #[test]
    fn reset_stream_reports_error_code() {
        let mut session = session();
        let mut buf = Vec::new();

        let stream_id = session.submit(&submission(0)).unwrap();
        session.send(&mut buf).unwrap();

        let mut input = SERVER_SETTINGS.to_vec();
        // RST_STREAM with REFUSED_STREAM
        input.extend_from_slice(&[0, 0, 4, 3, 0, 0, 0, 0, 1, 0, 0, 0, 7]);

        assert_eq!(
            session.recv(&input).unwrap(),
            [StreamEvent::Close {
                stream_id,
                error_code: 7
            }]
        );
    }

    #[test]
    fn garbage_input_is_a_session_error() {
        let mut session = session();
        let mut buf = Vec::new();

        session.send(&mut buf).unwrap();

        assert!(session.recv(b"HTTP/1.1 400 Bad Request\r\n\r\n").is_err());
    }

    fn frame_types(mut bytes: &[u8]) -> Vec<u8> {
        let mut types = Vec::new();

        while bytes.len() >= 9 {
            let len = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) as usize;
            types.push(bytes[3]);
            bytes = &bytes[(9 + len).min(bytes.len())..];
        }

        types
    }

    #[test]
    fn del_sends_goaway() {
        let mut session = session();
        let mut buf = Vec::new();

        session.send(&mut buf).unwrap();
        session.recv(SERVER_SETTINGS).unwrap();

        // GOAWAY is frame type 7.
        assert!(frame_types(&session.del()).contains(&7));
    }

    #[test]
    fn del_is_idempotent() {
        let mut session = session();
        let mut buf = Vec::new();

        session.send(&mut buf).unwrap();
        session.del();
        assert!(session.del().is_empty());

        // A new session starts with a new preface and new stream ids.
        buf.clear();
        assert_eq!(session.submit(&submission(0)).unwrap(), 1);
        session.send(&mut buf).unwrap();
        assert!(buf.starts_with(b"PRI * HTTP/2.0"));
    }
}
