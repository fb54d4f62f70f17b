use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Response {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,

    /// Wait this long before answering.
    pub delay: Option<Duration>,

    /// Reset the stream with this error code instead of answering.
    pub reset: Option<u32>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: Vec::new(),
            body: Vec::new(),
            delay: None,
            reset: None,
        }
    }
}

impl Response {
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}
