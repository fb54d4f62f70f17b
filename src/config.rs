//! Client configuration.
//!
//! Every parameter has a built-in default which can be overridden either in
//! code using the builder-style setters on [`Config`], or from the process
//! environment using [`Config::from_env`]. Environment variables follow the
//! `NCBI_CONFIG__PSG__<NAME>` convention, for example
//! `NCBI_CONFIG__PSG__REQUEST_TIMEOUT=20`.

use crate::Error;
use std::{env, fmt, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "NCBI_CONFIG__PSG__";

/// How much per-request diagnostic output to emit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DebugPrintout {
    /// No output.
    None,
    /// Requests, chunks (binary blob data elided), retries and failures.
    Some,
    /// Everything, including binary blob data.
    All,
}

impl Default for DebugPrintout {
    fn default() -> Self {
        DebugPrintout::None
    }
}

impl FromStr for DebugPrintout {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(DebugPrintout::None),
            "some" => Ok(DebugPrintout::Some),
            "all" => Ok(DebugPrintout::All),
            _ => Err(()),
        }
    }
}

/// Hint to the server on whether its caches should be consulted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UseCache {
    /// Let the server decide. Nothing is added to requests.
    Default,
    /// Bypass caches.
    No,
    /// Use caches only.
    Yes,
}

impl UseCache {
    /// Value of the `use_cache` query argument, if one should be sent.
    pub(crate) fn as_arg(&self) -> Option<&'static str> {
        match self {
            UseCache::Default => None,
            UseCache::No => Some("no"),
            UseCache::Yes => Some("yes"),
        }
    }
}

impl Default for UseCache {
    fn default() -> Self {
        UseCache::Default
    }
}

impl FromStr for UseCache {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(UseCache::Default),
            "no" => Ok(UseCache::No),
            "yes" => Ok(UseCache::Yes),
            _ => Err(()),
        }
    }
}

/// Configuration of the I/O layer and of request handling.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) rd_buf_size: usize,
    pub(crate) write_hiwater: usize,
    pub(crate) max_concurrent_streams: u32,
    pub(crate) num_io: usize,
    pub(crate) reader_timeout: u32,
    pub(crate) rebalance_time: Duration,
    pub(crate) request_timeout: u32,
    pub(crate) requests_per_io: usize,
    pub(crate) request_retries: u32,
    pub(crate) max_queue_size: usize,
    pub(crate) debug_printout: DebugPrintout,
    pub(crate) use_cache: UseCache,
    pub(crate) fail_on_unknown_items: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rd_buf_size: 64 * 1024,
            write_hiwater: 64 * 1024,
            max_concurrent_streams: 200,
            num_io: 6,
            reader_timeout: 12,
            rebalance_time: Duration::from_secs(10),
            request_timeout: 10,
            requests_per_io: 1,
            request_retries: 2,
            max_queue_size: 1024,
            debug_printout: DebugPrintout::None,
            use_cache: UseCache::Default,
            fail_on_unknown_items: false,
        }
    }
}

impl Config {
    /// Create a configuration with the defaults overridden by any
    /// `NCBI_CONFIG__PSG__*` environment variables that are set.
    pub fn from_env() -> Result<Self, Error> {
        Self::default().with_overrides(|name| env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let lookup = &lookup;

        if let Some(v) = parse(lookup, "RD_BUF_SIZE")? {
            self.rd_buf_size = v;
        }
        if let Some(v) = parse(lookup, "WRITE_HIWATER")? {
            self.write_hiwater = v;
        }
        if let Some(v) = parse(lookup, "MAX_CONCURRENT_STREAMS")? {
            self.max_concurrent_streams = v;
        }
        if let Some(v) = parse(lookup, "NUM_IO")? {
            self.num_io = v;
        }
        if let Some(v) = parse(lookup, "READER_TIMEOUT")? {
            self.reader_timeout = v;
        }
        if let Some(v) = parse::<f64>(lookup, "REBALANCE_TIME")? {
            if !v.is_finite() || v < 0.0 {
                return Err(invalid("REBALANCE_TIME", v));
            }
            self.rebalance_time = Duration::from_secs_f64(v);
        }
        if let Some(v) = parse(lookup, "REQUEST_TIMEOUT")? {
            self.request_timeout = v;
        }
        if let Some(v) = parse(lookup, "REQUESTS_PER_IO")? {
            self.requests_per_io = v;
        }
        if let Some(v) = parse(lookup, "REQUEST_RETRIES")? {
            self.request_retries = v;
        }
        if let Some(v) = parse(lookup, "MAX_QUEUE_SIZE")? {
            self.max_queue_size = v;
        }
        if let Some(v) = parse(lookup, "DEBUG_PRINTOUT")? {
            self.debug_printout = v;
        }
        if let Some(v) = parse(lookup, "USE_CACHE")? {
            self.use_cache = v;
        }
        if let Some(v) = lookup("FAIL_ON_UNKNOWN_ITEMS") {
            self.fail_on_unknown_items =
                parse_bool(&v).ok_or_else(|| invalid("FAIL_ON_UNKNOWN_ITEMS", v))?;
        }

        Ok(self)
    }

    /// Size of the buffer used for each socket read.
    pub fn rd_buf_size(mut self, size: usize) -> Self {
        self.rd_buf_size = size.max(1);
        self
    }

    /// Capacity reserved up front for each outgoing write buffer.
    pub fn write_hiwater(mut self, size: usize) -> Self {
        self.write_hiwater = size;
        self
    }

    /// Upper bound on concurrent HTTP/2 streams per session. The effective
    /// limit is the smaller of this and the limit advertised by the server.
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max.max(1);
        self
    }

    /// Number of I/O threads.
    pub fn num_io(mut self, num: usize) -> Self {
        self.num_io = num.max(1);
        self
    }

    /// Whole seconds a session with in-flight requests may go without
    /// receiving anything before it is reset.
    pub fn reader_timeout(mut self, seconds: u32) -> Self {
        self.reader_timeout = seconds;
        self
    }

    /// Interval between re-discoveries of the service's servers.
    pub fn rebalance_time(mut self, interval: Duration) -> Self {
        self.rebalance_time = interval;
        self
    }

    /// Whole seconds a single attempt of a request may take.
    pub fn request_timeout(mut self, seconds: u32) -> Self {
        self.request_timeout = seconds;
        self
    }

    /// How many consecutive requests go to the same I/O thread before the
    /// next thread is picked.
    pub fn requests_per_io(mut self, count: usize) -> Self {
        self.requests_per_io = count.max(1);
        self
    }

    /// Default number of retries for requests that do not set their own.
    pub fn request_retries(mut self, retries: u32) -> Self {
        self.request_retries = retries;
        self
    }

    /// Capacity of the intake queue of each I/O thread.
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size.max(1);
        self
    }

    pub fn debug_printout(mut self, level: DebugPrintout) -> Self {
        self.debug_printout = level;
        self
    }

    pub fn use_cache(mut self, use_cache: UseCache) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Record a reply error for items of an unrecognized type instead of
    /// skipping them.
    pub fn fail_on_unknown_items(mut self, fail: bool) -> Self {
        self.fail_on_unknown_items = fail;
        self
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, Error> {
    match lookup(name) {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(invalid(name, value)),
        },
        None => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid(name: &'static str, value: impl fmt::Display) -> Error {
    Error::InvalidConfig {
        name,
        value: value.to_string(),
    }
}
