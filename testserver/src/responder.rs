use crate::{request::Request, response::Response};

/// Produces the response to a request, or passes it on to the next responder
/// by returning `None`.
pub trait Responder: Send + Sync + 'static {
    fn respond(&self, request: Request) -> Option<Response>;
}

impl<F> Responder for F
where
    F: Fn(Request) -> Option<Response> + Send + Sync + 'static,
{
    fn respond(&self, request: Request) -> Option<Response> {
        (self)(request)
    }
}
