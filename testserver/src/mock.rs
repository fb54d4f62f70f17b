//! A tiny mock HTTP/2 server to allow tests to inspect outgoing requests and
//! return specific responses.
//!
//! Only prior knowledge HTTP/2 over plain TCP is spoken, which is all a PSG
//! client uses.

use crate::{request::Request, responder::Responder, response::Response};
use bytes::Bytes;
use h2::server::SendResponse;
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

/// A mock HTTP/2 endpoint.
#[derive(Clone)]
pub struct Mock(Arc<Inner>);

struct Inner {
    addr: SocketAddr,

    requests: Mutex<VecDeque<Request>>,

    /// Number of requests received since the mock was created.
    request_counter: AtomicU32,

    /// Number of connections accepted since the mock was created.
    connection_counter: AtomicUsize,

    /// A list of responders. When receiving a request each responder is tried
    /// in order until one returns a response.
    responders: Vec<Box<dyn Responder>>,
}

impl Mock {
    /// Create a new mock server with a single responder.
    pub fn new<R: Responder>(responder: R) -> Self {
        Self::builder().responder(responder).build()
    }

    /// Create a builder for creating a customized mock server.
    pub fn builder() -> Builder {
        Builder {
            responders: vec![],
        }
    }

    /// Get the socket address of this mock server.
    pub fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    /// Get the service string naming this mock server.
    pub fn service(&self) -> String {
        self.addr().to_string()
    }

    /// Get the number of requests received so far by this mock.
    pub fn requests_received(&self) -> u32 {
        self.0.request_counter.load(Ordering::SeqCst)
    }

    /// Get the number of connections accepted so far by this mock.
    pub fn connections(&self) -> usize {
        self.0.connection_counter.load(Ordering::SeqCst)
    }

    /// Get the first request received by this mock.
    pub fn request(&self) -> Request {
        let request = self.0.requests.lock().unwrap().front().cloned();

        request.expect("no request received")
    }

    /// Get all requests received by this mock, in order of arrival.
    pub fn requests(&self) -> Vec<Request> {
        self.0.requests.lock().unwrap().iter().cloned().collect()
    }

    async fn serve(self, listener: std::net::TcpListener) {
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        while let Ok((socket, _)) = listener.accept().await {
            self.0.connection_counter.fetch_add(1, Ordering::SeqCst);

            let mock = self.clone();

            tokio::spawn(async move {
                let mut connection = match h2::server::handshake(socket).await {
                    Ok(connection) => connection,
                    Err(_) => return,
                };

                while let Some(Ok((request, respond))) = connection.accept().await {
                    let mock = mock.clone();

                    tokio::spawn(async move { mock.handle_request(request, respond).await });
                }
            });
        }
    }

    async fn handle_request(
        &self,
        request: http::Request<h2::RecvStream>,
        mut respond: SendResponse<Bytes>,
    ) {
        // Build a record of the request received.
        let mock_request = Request {
            number: self.0.request_counter.fetch_add(1, Ordering::SeqCst),
            method: request.method().to_string(),
            path: request
                .uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_default(),
            headers: request
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        };

        self.0
            .requests
            .lock()
            .unwrap()
            .push_back(mock_request.clone());

        let response = self
            .0
            .responders
            .iter()
            .find_map(|responder| responder.respond(mock_request.clone()))
            .unwrap_or(Response {
                status_code: 404,
                ..Response::default()
            });

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(code) = response.reset {
            respond.send_reset(h2::Reason::from(code));
            return;
        }

        let mut builder = http::Response::builder().status(response.status_code);

        for (name, value) in &response.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let end_of_stream = response.body.is_empty();

        if let Ok(mut stream) = respond.send_response(builder.body(()).unwrap(), end_of_stream) {
            if !end_of_stream {
                let _ = stream.send_data(Bytes::from(response.body), true);
            }
        }
    }
}

/// A builder for creating mock servers.
pub struct Builder {
    responders: Vec<Box<dyn Responder>>,
}

impl Builder {
    /// Add a responder to the mock. Responders are tried in the order that they
    /// are added to the builder.
    pub fn responder<R: Responder>(mut self, responder: R) -> Self {
        self.responders.push(Box::new(responder));
        self
    }

    /// Start a new mock server.
    pub fn build(self) -> Mock {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();

        let mock = Mock(Arc::new(Inner {
            addr: listener.local_addr().unwrap(),
            requests: Default::default(),
            request_counter: AtomicU32::new(0),
            connection_counter: AtomicUsize::new(0),
            responders: self.responders,
        }));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        thread::Builder::new()
            .name(format!("mock-{}", mock.addr()))
            .spawn({
                let mock = mock.clone();

                move || runtime.block_on(mock.serve(listener))
            })
            .unwrap();

        mock
    }
}
