use crate::{
    config::{Config, DebugPrintout},
    context::{DiagContext, RequestContext},
    debug::DebugPrinter,
    parser::Parser,
    reply::{ReplyData, UserContext},
};
use std::{any::Any, fmt, sync::Arc};
use url::form_urlencoded;

/// Description of a request to send to the service.
///
/// ```
/// use psg_client::Request;
///
/// let request = Request::new("/ID/get")
///     .arg("seq_id", "NC_000001")
///     .arg("tse", "whole")
///     .retries(1);
///
/// assert_eq!(request.path_and_query(), "/ID/get?seq_id=NC_000001&tse=whole");
/// ```
#[derive(Clone)]
pub struct Request {
    path: String,
    query: String,
    context: Option<RequestContext>,
    user_context: Option<UserContext>,
    retries: Option<u32>,
}

impl Request {
    /// Create a request for an absolute path, such as `/ID/resolve`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: String::new(),
            context: None,
            user_context: None,
            retries: None,
        }
    }

    /// Append an argument to the query string. Both key and value are
    /// encoded.
    pub fn arg(mut self, key: &str, value: &str) -> Self {
        append_pair(&mut self.query, key, value);
        self
    }

    /// Append an already encoded `key=value&...` string to the query string.
    pub fn query(mut self, query: &str) -> Self {
        let query = query.trim_start_matches(|c| c == '?' || c == '&');

        if !query.is_empty() {
            if !self.query.is_empty() {
                self.query.push('&');
            }

            self.query.push_str(query);
        }

        self
    }

    /// Correlation identifiers to send with the request. A context derived
    /// from the queue's [`DiagContext`] is used if none is set.
    pub fn context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Attach an arbitrary value that can later be retrieved from the reply
    /// with [`Reply::user_context`](crate::Reply::user_context).
    pub fn user_context<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.user_context = Some(Arc::new(value));
        self
    }

    /// Number of times the request is sent again after a transport failure.
    /// Defaults to [`Config::request_retries`].
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// The absolute path followed by the query string, if any.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// Turn the request into what is handed over to an I/O thread.
    pub(crate) fn into_submission(
        self,
        config: &Config,
        diag: &DiagContext,
        signal: Option<Arc<event_listener::Event>>,
    ) -> Submission {
        let mut query = self.query;

        if let Some(use_cache) = config.use_cache.as_arg() {
            append_pair(&mut query, "use_cache", use_cache);
        }

        append_pair(&mut query, "client_id", diag.client_id());

        let full_path = format!("{}?{}", self.path, query);
        let reply = ReplyData::new(config.fail_on_unknown_items, signal)
            .with_user_context(self.user_context);

        Submission::new(
            full_path,
            Arc::new(reply),
            self.context.unwrap_or_else(|| diag.request_context()),
            self.retries.unwrap_or(config.request_retries),
            config.debug_printout,
        )
    }
}

fn append_pair(query: &mut String, key: &str, value: &str) {
    form_urlencoded::Serializer::for_suffix(query, 0).append_pair(key, value);
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("path", &self.path_and_query())
            .field("retries", &self.retries)
            .finish()
    }
}

/// A request on its way through the I/O layer.
///
/// Owned by exactly one place at a time: an intake queue, or the session
/// that has it in flight.
pub(crate) struct Submission {
    pub(crate) full_path: String,
    pub(crate) reply: Arc<ReplyData>,
    pub(crate) context: RequestContext,
    pub(crate) debug: DebugPrinter,
    retries: u32,
    parser: Parser,
}

impl Submission {
    pub(crate) fn new(
        full_path: String,
        reply: Arc<ReplyData>,
        context: RequestContext,
        retries: u32,
        debug: DebugPrintout,
    ) -> Self {
        Self {
            full_path,
            reply,
            context,
            debug: DebugPrinter::new(debug),
            retries,
            parser: Parser::default(),
        }
    }

    /// Start a new attempt. Anything parsed during a previous attempt is
    /// discarded.
    pub(crate) fn restart(&mut self) {
        self.parser = Parser::default();
    }

    /// Use up one retry. Returns the number of retries left afterwards, or
    /// `None` if there were none left.
    pub(crate) fn take_retry(&mut self) -> Option<u32> {
        if self.retries > 0 {
            self.retries -= 1;
            Some(self.retries)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn retries(&self) -> u32 {
        self.retries
    }

    /// Feed a piece of the response body.
    pub(crate) fn on_data(&mut self, data: &[u8]) {
        if data.is_empty() || self.parser.is_failed() {
            return;
        }

        // A response has started arriving, so sending the request again
        // would deliver the same data twice.
        self.retries = 0;

        let reply = &self.reply;
        let debug = &self.debug;

        let result = self.parser.feed(data, |args, chunk| {
            debug.chunk(&args, &chunk);
            reply.add_chunk(args, chunk);
        });

        if let Err(message) = result {
            tracing::debug!("malformed reply: {}", message);
            reply.add_error(message);
        }
    }

    /// Record a terminal failure of the request.
    pub(crate) fn fail(&self, error: &dyn fmt::Display) {
        self.debug.gave_up(error);
        self.reply.fail(error.to_string());
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("full_path", &self.full_path)
            .field("retries", &self.retries)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::UseCache,
        reply::{NextItem, Reply, Status},
        Deadline,
    };

    pub(crate) fn submission(retries: u32) -> Submission {
        Submission::new(
            "/ID/get?seq_id=1".into(),
            Arc::new(ReplyData::new(false, None)),
            RequestContext::new("sid", "phid"),
            retries,
            DebugPrintout::None,
        )
    }

    #[test]
    fn full_path_carries_client_id() {
        let diag = DiagContext::new();
        let submission = Request::new("/ID/resolve")
            .arg("seq_id", "a b")
            .into_submission(&Config::default(), &diag, None);

        assert_eq!(
            submission.full_path,
            format!("/ID/resolve?seq_id=a+b&client_id={}", diag.client_id())
        );
    }

    #[test]
    fn full_path_carries_cache_hint() {
        let diag = DiagContext::new();
        let config = Config::default().use_cache(UseCache::Yes);
        let submission = Request::new("/ID/get")
            .query("?seq_id=1")
            .into_submission(&config, &diag, None);

        assert!(submission
            .full_path
            .starts_with("/ID/get?seq_id=1&use_cache=yes&client_id="));
    }

    #[test]
    fn raw_query_is_appended() {
        let request = Request::new("/ID/get").arg("a", "1").query("b=2&c=3").arg("d", "4");

        assert_eq!(request.path_and_query(), "/ID/get?a=1&b=2&c=3&d=4");
    }

    #[test]
    fn retries_default_to_config() {
        let diag = DiagContext::new();
        let config = Config::default().request_retries(5);

        assert_eq!(
            Request::new("/").into_submission(&config, &diag, None).retries(),
            5
        );
        assert_eq!(
            Request::new("/")
                .retries(0)
                .into_submission(&config, &diag, None)
                .retries(),
            0
        );
    }

    #[test]
    fn user_context_reaches_the_reply() {
        let diag = DiagContext::new();
        let submission = Request::new("/")
            .user_context(42u32)
            .into_submission(&Config::default(), &diag, None);
        let reply = Reply::new(submission.reply.clone());

        assert_eq!(reply.user_context::<u32>(), Some(&42));
        assert_eq!(reply.user_context::<String>(), None);
    }

    #[test]
    fn data_disables_retries() {
        let mut submission = submission(2);

        assert_eq!(submission.take_retry(), Some(1));

        submission.on_data(b"\n\nPSG");

        assert_eq!(submission.take_retry(), None);
    }

    #[test]
    fn single_item_reply_fed_byte_by_byte() {
        let mut submission = submission(0);
        let reply = Reply::new(submission.reply.clone());

        let body = concat!(
            "\n\nPSG-Reply-Chunk: item_id=1&item_type=blob_prop&chunk_type=meta&n_chunks=2\n",
            "\n\nPSG-Reply-Chunk: item_id=1&item_type=blob_prop&chunk_type=data&size=5\n",
            "props",
            "\n\nPSG-Reply-Chunk: item_type=reply&chunk_type=meta&n_chunks=3\n",
        );

        for byte in body.as_bytes() {
            submission.on_data(std::slice::from_ref(byte));
        }

        submission.reply.set_success();

        assert_eq!(reply.status(Deadline::now()), Status::Success);

        match reply.next_item(Deadline::now()) {
            NextItem::Item(item) => {
                assert_eq!(item.item_type(), &crate::ItemType::BlobProp);
                assert_eq!(item.status(Deadline::now()), Status::Success);
                assert_eq!(item.chunks().len(), 1);
                assert_eq!(item.data(), b"props");
            }
            other => panic!("expected item, got {:?}", other),
        }

        assert!(matches!(reply.next_item(Deadline::now()), NextItem::EndOfReply));
    }

    #[test]
    fn malformed_body_fails_the_reply() {
        let mut submission = submission(2);
        let reply = Reply::new(submission.reply.clone());

        submission.on_data(b"<html>");
        submission.on_data(b"\n\nPSG-Reply-Chunk: chunk_type=meta&n_chunks=1\n");

        assert_eq!(reply.status(Deadline::now()), Status::Error);
        assert_eq!(reply.next_message().as_deref(), Some("<html>"));
        assert_eq!(reply.next_message(), None);
        assert_eq!(submission.retries(), 0);
    }

    #[test]
    fn giving_up_after_partial_data_fails_open_items() {
        let mut submission = submission(2);
        let reply = Reply::new(submission.reply.clone());

        submission.on_data(
            concat!(
                "\n\nPSG-Reply-Chunk: item_id=1&item_type=blob&chunk_type=meta&n_chunks=3\n",
                "\n\nPSG-Reply-Chunk: item_id=1&item_type=blob&chunk_type=data&blob_chunk=0&size=4\n",
                "part",
            )
            .as_bytes(),
        );
        submission.fail(&"transport error: server disconnected");

        let item = match reply.next_item(Deadline::now()) {
            NextItem::Item(item) => item,
            other => panic!("expected item, got {:?}", other),
        };

        assert_eq!(item.status(Deadline::now()), Status::Error);
        assert_eq!(
            item.next_message().as_deref(),
            Some("transport error: server disconnected")
        );
        assert_eq!(reply.status(Deadline::now()), Status::Error);
        assert!(matches!(reply.next_item(Deadline::now()), NextItem::EndOfReply));
    }
}
