//! Diagnostic context carried by every request for correlation on the
//! server side.

use crossbeam_utils::atomic::AtomicCell;
use std::{
    net::IpAddr,
    process,
    time::{SystemTime, UNIX_EPOCH},
};

static UID_COUNTER: AtomicCell<u64> = AtomicCell::new(0);

/// Generate an identifier that is unique across processes and hosts with
/// high probability.
fn generate_uid() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let count = UID_COUNTER.fetch_add(1);

    format!(
        "{:08X}{:08X}{:04X}",
        process::id(),
        now.as_secs() as u32 ^ now.subsec_nanos(),
        count as u16
    )
}

/// Process-wide diagnostic information.
///
/// Created once, before any queue, and shared read-only by every I/O thread.
#[derive(Clone, Debug)]
pub struct DiagContext {
    user_agent: String,
    session_id: String,
    client_id: String,
    client_ip: Option<IpAddr>,
}

impl Default for DiagContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagContext {
    /// Create a context for an unnamed application.
    pub fn new() -> Self {
        Self {
            user_agent: format!("UNKNOWN/UNKNOWN psg-client/{}", env!("CARGO_PKG_VERSION")),
            session_id: generate_uid(),
            client_id: generate_uid(),
            client_ip: None,
        }
    }

    /// Name the application in the user agent sent with each request.
    pub fn application(mut self, name: &str, version: &str) -> Self {
        self.user_agent = format!(
            "{}/{} psg-client/{}",
            name,
            version,
            env!("CARGO_PKG_VERSION")
        );
        self
    }

    /// Default session id for requests that do not carry their own.
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Address of the end user on whose behalf requests are made.
    pub fn client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn default_session_id(&self) -> &str {
        &self.session_id
    }

    /// Identifier of this client process, sent as `client_id` with every
    /// request.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn default_client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    /// Create a request context inheriting this context's defaults and a
    /// freshly generated hit id.
    pub fn request_context(&self) -> RequestContext {
        RequestContext {
            session_id: self.session_id.clone(),
            hit_id: generate_uid(),
            client_ip: self.client_ip,
            sub_hit: AtomicCell::new(0),
        }
    }
}

/// Correlation identifiers of a single request.
///
/// Every attempt to send the request, including retries, uses a new sub-hit
/// id derived from the hit id.
#[derive(Debug)]
pub struct RequestContext {
    session_id: String,
    hit_id: String,
    client_ip: Option<IpAddr>,
    sub_hit: AtomicCell<u32>,
}

impl RequestContext {
    pub fn new(session_id: impl Into<String>, hit_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            hit_id: hit_id.into(),
            client_ip: None,
            sub_hit: AtomicCell::new(0),
        }
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn hit_id(&self) -> &str {
        &self.hit_id
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    /// Produce the next sub-hit id, `<hit_id>.<n>` with `n` starting at 1.
    pub(crate) fn next_sub_hit_id(&self) -> String {
        let n = self.sub_hit.fetch_add(1) + 1;
        format!("{}.{}", self.hit_id, n)
    }
}

impl Clone for RequestContext {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id.clone(),
            hit_id: self.hit_id.clone(),
            client_ip: self.client_ip,
            sub_hit: AtomicCell::new(self.sub_hit.load()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(DiagContext: Send, Sync);
    static_assertions::assert_impl_all!(RequestContext: Send, Sync);

    #[test]
    fn default_user_agent() {
        let context = DiagContext::new();

        assert!(context.user_agent().starts_with("UNKNOWN/UNKNOWN psg-client/"));
    }

    #[test]
    fn application_user_agent() {
        let context = DiagContext::new().application("sequence_fetch", "2.1");

        assert_eq!(
            context.user_agent(),
            format!("sequence_fetch/2.1 psg-client/{}", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn uids_are_distinct() {
        assert_ne!(generate_uid(), generate_uid());
    }

    #[test]
    fn sub_hit_ids_increment() {
        let context = RequestContext::new("sid", "PHID");

        assert_eq!(context.next_sub_hit_id(), "PHID.1");
        assert_eq!(context.next_sub_hit_id(), "PHID.2");
        assert_eq!(context.clone().next_sub_hit_id(), "PHID.3");
    }

    #[test]
    fn request_context_inherits_defaults() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let context = DiagContext::new().session_id("S1").client_ip(ip);
        let request = context.request_context();

        assert_eq!(request.session_id(), "S1");
        assert_eq!(request.client_ip(), Some(ip));
        assert!(!request.hit_id().is_empty());
    }
}
