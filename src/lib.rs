//! Client transport for the PubSeq Gateway (PSG) service.
//!
//! Requests are multiplexed as HTTP/2 streams over one connection per server,
//! spread over a pool of I/O threads. Every reply is a sequence of chunks
//! framed inside the response body, each chunk belonging either to the reply
//! itself or to one of its items. Replies and items are filled in by the I/O
//! threads while the caller waits on them with a deadline.
//!
//! ```no_run
//! use psg_client::{Deadline, NextItem, Queue, Request};
//! use std::time::Duration;
//!
//! let queue = Queue::new("psg11:2180,psg12:2180")?;
//!
//! queue.send_request(
//!     Request::new("/ID/resolve").arg("psg_resolve", "seq_id=NC_000001"),
//!     Deadline::infinite(),
//! )?;
//!
//! if let Some(reply) = queue.next_reply(Duration::from_secs(10)) {
//!     while let NextItem::Item(item) = reply.next_item(Duration::from_secs(10)) {
//!         println!("{:?}: {} bytes", item.item_type(), item.data().len());
//!     }
//!
//!     while let Some(message) = reply.next_message() {
//!         eprintln!("{}", message);
//!     }
//! }
//! # Ok::<(), psg_client::Error>(())
//! ```
//!
//! # Logging
//!
//! All diagnostics are emitted with [`tracing`]. With
//! [`Config::debug_printout`] enabled, the progress of every request is
//! additionally logged at `info` level under the `psg_client::debug` target.

#![deny(unsafe_code)]
#![warn(
    future_incompatible,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]

mod args;
mod config;
mod context;
mod deadline;
mod debug;
mod discovery;
mod error;
mod io;
mod parser;
mod queue;
mod reply;
mod request;

pub use crate::{
    args::Args,
    config::{Config, DebugPrintout, UseCache},
    context::{DiagContext, RequestContext},
    deadline::Deadline,
    discovery::{ServiceDiscovery, ServiceList, StaticServers},
    error::Error,
    io::IoCoordinator,
    queue::{EventLoop, Queue, QueueBuilder},
    reply::{Item, ItemType, NextItem, Reply, SkipReason, Status},
    request::Request,
};
