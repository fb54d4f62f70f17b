//! Replies and the items they are made of.
//!
//! A reply is shared between the I/O thread that fills it in and any number
//! of caller threads that observe it. Every mutable part sits behind a
//! per-object lock, and every mutation is followed by a notification so that
//! blocked callers wake up. States only ever move forward, out of
//! [`Status::InProgress`].

use crate::{args::Args, deadline::Deadline};
use bytes::Bytes;
use event_listener::Event;
use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Highest accepted `blob_chunk` index plus one.
const MAX_BLOB_CHUNKS: usize = 1 << 20;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Completion state of a reply or an item.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// Still receiving.
    InProgress,
    /// Everything that was announced has been received.
    Success,
    /// The server does not have what was asked for.
    NotFound,
    /// Something went wrong. Details are available as messages.
    Error,
}

impl Status {
    pub fn is_complete(&self) -> bool {
        *self != Status::InProgress
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::InProgress => "in progress",
            Status::Success => "success",
            Status::NotFound => "not found",
            Status::Error => "error",
        })
    }
}

/// Why the server did not send a blob.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// Excluded by the request.
    Excluded,
    /// Being sent in another reply at the moment.
    InProgress,
    /// Already sent earlier.
    Sent,
    Unknown,
}

/// Kind of data an item carries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ItemType {
    BioseqInfo,
    BlobProp,
    Blob,
    SkippedBlob(SkipReason),
    NamedAnnotInfo,
    PublicComment,
    Processor,
    /// An item type this client does not know about.
    Unknown(String),
}

impl ItemType {
    fn from_args(args: &Args) -> Self {
        let name = args.get("item_type").unwrap_or_default();

        match name {
            "bioseq_info" => ItemType::BioseqInfo,
            "blob_prop" => ItemType::BlobProp,
            "blob" => match args.get("reason") {
                None => ItemType::Blob,
                Some("excluded") => ItemType::SkippedBlob(SkipReason::Excluded),
                Some("inprogress") => ItemType::SkippedBlob(SkipReason::InProgress),
                Some("sent") => ItemType::SkippedBlob(SkipReason::Sent),
                Some(_) => ItemType::SkippedBlob(SkipReason::Unknown),
            },
            "bioseq_na" | "na" => ItemType::NamedAnnotInfo,
            "public_comment" => ItemType::PublicComment,
            "processor" => ItemType::Processor,
            other => ItemType::Unknown(other.to_owned()),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, ItemType::Unknown(_))
    }
}

/// Mutable part of an item.
#[derive(Debug)]
pub(crate) struct ItemState {
    status: Status,
    empty: bool,
    messages: VecDeque<String>,
    chunks: Vec<Bytes>,
    expected: Option<usize>,
    received: usize,
}

impl Default for ItemState {
    fn default() -> Self {
        Self {
            status: Status::InProgress,
            empty: true,
            messages: VecDeque::new(),
            chunks: Vec::new(),
            expected: None,
            received: 0,
        }
    }
}

impl ItemState {
    pub(crate) fn status(&self) -> Status {
        self.status
    }

    /// Move out of the in-progress state. Completed states are final.
    pub(crate) fn set_status(&mut self, status: Status) {
        if self.status == Status::InProgress {
            self.status = status;
        }
    }

    pub(crate) fn add_error(&mut self, message: impl Into<String>) {
        self.add_error_with(message, Status::Error);
    }

    /// Record an error message, completing the item with `status` if it is
    /// still in progress. Further messages are appended to an item that has
    /// already failed.
    pub(crate) fn add_error_with(&mut self, message: impl Into<String>, status: Status) {
        let message = message.into();

        match self.status {
            Status::InProgress => {
                self.status = status;
                self.messages.push_back(message);
            }
            Status::Error => self.messages.push_back(message),
            other => tracing::error!("unexpected state {:?} for error '{}'", other, message),
        }
    }

    /// Count one more received chunk, flagging a protocol error if that is
    /// more than announced.
    fn add_received(&mut self) {
        self.received += 1;
        self.check_received();
    }

    fn check_received(&mut self) {
        if matches!(self.expected, Some(expected) if expected < self.received) {
            self.add_error("Protocol error: received more than expected");
        }
    }

    fn set_expected(&mut self, expected: usize) {
        match self.expected {
            Some(declared) if declared != expected => {
                self.add_error("Protocol error: contradicting n_chunks")
            }
            _ => {
                self.expected = Some(expected);
                self.check_received();
            }
        }
    }

    fn set_chunk(&mut self, index: usize, chunk: Bytes) {
        if self.chunks.len() <= index {
            self.chunks.resize(index + 1, Bytes::new());
        }

        self.chunks[index] = chunk;
        self.empty = false;
    }

    /// Complete the item after its stream closed normally.
    fn set_success(&mut self) {
        if self.expected == Some(self.received) {
            self.set_status(Status::Success);
        } else if self.status == Status::InProgress {
            self.add_error("Protocol error: received less than expected");
        }
    }
}

/// An item together with its change notification.
#[derive(Debug)]
pub(crate) struct ItemData {
    item_type: ItemType,
    args: Args,
    state: Mutex<ItemState>,
    changed: Event,
}

impl ItemData {
    fn new(item_type: ItemType, args: Args) -> Self {
        Self {
            item_type,
            args,
            state: Mutex::new(ItemState::default()),
            changed: Event::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ItemState> {
        lock(&self.state)
    }

    /// Block until the item is complete or `deadline` expires.
    fn wait_complete(&self, deadline: Deadline) -> Status {
        loop {
            let listener = self.changed.listen();
            let status = self.lock().status;

            if status.is_complete() || !deadline.wait(listener) {
                return status;
            }
        }
    }

    fn wait_not_empty(&self, deadline: Deadline) -> bool {
        loop {
            let listener = self.changed.listen();

            {
                let state = self.lock();

                if !state.empty {
                    return true;
                }

                if state.status.is_complete() {
                    return false;
                }
            }

            if !deadline.wait(listener) {
                return false;
            }
        }
    }
}

#[derive(Debug, Default)]
struct Items {
    list: Vec<Arc<ItemData>>,
    by_id: HashMap<String, Arc<ItemData>>,
    cursor: usize,
}

pub(crate) type UserContext = Arc<dyn Any + Send + Sync>;

/// State of a reply shared between the I/O layer and its observers.
pub(crate) struct ReplyData {
    reply_item: ItemData,
    items: Mutex<Items>,
    fail_on_unknown_items: bool,
    signal: Option<Arc<Event>>,
    user_context: Option<UserContext>,
}

impl fmt::Debug for ReplyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyData")
            .field("reply_item", &self.reply_item)
            .field("items", &self.items)
            .finish()
    }
}

impl ReplyData {
    /// Create a new reply. `signal` is notified on every change of the reply
    /// or any of its items.
    pub(crate) fn new(fail_on_unknown_items: bool, signal: Option<Arc<Event>>) -> Self {
        Self {
            reply_item: ItemData::new(ItemType::Unknown("reply".into()), Args::default()),
            items: Mutex::new(Items::default()),
            fail_on_unknown_items,
            signal,
            user_context: None,
        }
    }

    pub(crate) fn with_user_context(mut self, user_context: Option<UserContext>) -> Self {
        self.user_context = user_context;
        self
    }

    pub(crate) fn reply_item(&self) -> MutexGuard<'_, ItemState> {
        self.reply_item.lock()
    }

    /// Wake up everyone waiting on the reply.
    pub(crate) fn notify(&self) {
        self.reply_item.changed.notify(usize::MAX);

        if let Some(signal) = self.signal.as_ref() {
            signal.notify(usize::MAX);
        }
    }

    fn notify_item(&self, item: &ItemData) {
        item.changed.notify(usize::MAX);
        self.notify();
    }

    /// Record a reply level error and wake up observers.
    pub(crate) fn add_error(&self, message: impl Into<String>) {
        self.reply_item().add_error(message);
        self.notify();
    }

    /// Fail the reply for good. Items still in progress fail with the same
    /// message, since nothing more will arrive for them.
    pub(crate) fn fail(&self, message: impl Into<String>) {
        let message = message.into();

        self.reply_item().add_error(message.clone());
        self.notify();

        let items = lock(&self.items).list.clone();

        for item in items {
            let mut state = item.lock();

            if state.status() == Status::InProgress {
                state.add_error(message.clone());
                drop(state);
                self.notify_item(&item);
            }
        }
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.reply_item().set_status(status);
        self.notify();
    }

    /// Assign a complete chunk to the reply or to one of its items.
    pub(crate) fn add_chunk(&self, args: Args, chunk: Bytes) {
        let item_type = args.get("item_type").unwrap_or_default();

        if item_type.is_empty() || item_type == "reply" {
            apply_chunk(&mut self.reply_item(), &args, chunk);
            self.notify();
            return;
        }

        self.reply_item().add_received();

        let item_id = args.get("item_id").unwrap_or_default().to_owned();
        let item = {
            let mut items = lock(&self.items);

            match items.by_id.get(&item_id) {
                Some(item) => item.clone(),
                None => {
                    let item_type = ItemType::from_args(&args);

                    if item_type.is_unknown() && self.fail_on_unknown_items {
                        self.reply_item().add_error(format!(
                            "Protocol error: unknown item type '{}'",
                            args.get("item_type").unwrap_or_default()
                        ));
                    }

                    let item = Arc::new(ItemData::new(item_type, args.clone()));
                    items.list.push(item.clone());
                    items.by_id.insert(item_id, item.clone());
                    item
                }
            }
        };

        apply_chunk(&mut item.lock(), &args, chunk);
        self.notify_item(&item);
    }

    /// Complete the reply and each of its items after the stream closed
    /// normally.
    pub(crate) fn set_success(&self) {
        self.reply_item().set_success();
        self.notify();

        let items = lock(&self.items).list.clone();

        for item in items {
            item.lock().set_success();
            self.notify_item(&item);
        }
    }

    pub(crate) fn status(&self) -> Status {
        self.reply_item().status()
    }
}

fn apply_chunk(item: &mut ItemState, args: &Args, chunk: Bytes) {
    item.add_received();

    match args.get("chunk_type").unwrap_or_default() {
        "meta" => match args.get("n_chunks") {
            Some(n_chunks) => match n_chunks.trim().parse() {
                Ok(expected) => item.set_expected(expected),
                Err(_) => item.add_error("Protocol error: invalid n_chunks"),
            },
            None => {}
        },
        "message" => {
            let message = String::from_utf8_lossy(&chunk);

            match args.get("severity").unwrap_or_default() {
                "warning" => tracing::warn!("{}", message),
                "info" => tracing::info!("{}", message),
                "trace" => tracing::trace!("{}", message),
                _ => {
                    let status = if args.get("status") == Some("404") {
                        Status::NotFound
                    } else {
                        Status::Error
                    };

                    item.add_error_with(message, status);
                }
            }
        }
        "data" => match args.get("blob_chunk").map(|v| v.trim().parse::<usize>()) {
            None => item.set_chunk(0, chunk),
            Some(Ok(index)) if index < MAX_BLOB_CHUNKS => item.set_chunk(index, chunk),
            Some(_) => item.add_error("Protocol error: invalid blob_chunk"),
        },
        _ => item.add_error("Protocol error: unknown chunk type"),
    }
}

/// Result of [`Reply::next_item`].
#[derive(Debug)]
pub enum NextItem {
    /// The next item of the reply.
    Item(Item),
    /// The reply is complete and every item has been returned.
    EndOfReply,
    /// The deadline expired before another item arrived.
    Timeout,
}

/// Handle to the reply of a submitted request.
///
/// Clones share the same reply, including the position of
/// [`Reply::next_item`].
#[derive(Clone)]
pub struct Reply {
    data: Arc<ReplyData>,
}

impl Reply {
    pub(crate) fn new(data: Arc<ReplyData>) -> Self {
        Self { data }
    }

    /// Wait for the reply to complete and get its status. Returns
    /// [`Status::InProgress`] if `deadline` expires first.
    pub fn status(&self, deadline: impl Into<Deadline>) -> Status {
        self.data.reply_item.wait_complete(deadline.into())
    }

    /// Wait for the next item of the reply.
    ///
    /// Items of a type this client does not know are skipped.
    pub fn next_item(&self, deadline: impl Into<Deadline>) -> NextItem {
        let deadline = deadline.into();

        loop {
            let listener = self.data.reply_item.changed.listen();

            // Status must be read before looking for items, otherwise items
            // added just before completion could be missed.
            let complete = self.data.status().is_complete();

            let next = {
                let mut items = lock(&self.data.items);

                let mut next = None;

                while items.cursor < items.list.len() {
                    let item = items.list[items.cursor].clone();
                    items.cursor += 1;

                    if let ItemType::Unknown(name) = &item.item_type {
                        tracing::warn!("skipping item of unknown type '{}'", name);
                        continue;
                    }

                    next = Some(item);
                    break;
                }

                next
            };

            if let Some(data) = next {
                return NextItem::Item(Item {
                    data,
                    reply: self.data.clone(),
                });
            }

            if complete {
                return NextItem::EndOfReply;
            }

            if !deadline.wait(listener) {
                return NextItem::Timeout;
            }
        }
    }

    /// Take the oldest reply level message, if any.
    pub fn next_message(&self) -> Option<String> {
        self.data.reply_item().messages.pop_front()
    }

    /// Get the value attached to the request with
    /// [`Request::user_context`](crate::Request::user_context), if it is of
    /// type `T`.
    pub fn user_context<T: Any>(&self) -> Option<&T> {
        self.data.user_context.as_ref()?.downcast_ref()
    }

    /// Get the current status without waiting.
    pub fn current_status(&self) -> Status {
        self.data.status()
    }

    pub(crate) fn data(&self) -> &Arc<ReplyData> {
        &self.data
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("status", &self.current_status())
            .finish()
    }
}

/// One unit of a reply, such as the properties or data of a blob.
#[derive(Clone)]
pub struct Item {
    data: Arc<ItemData>,
    reply: Arc<ReplyData>,
}

impl Item {
    pub fn item_type(&self) -> &ItemType {
        &self.data.item_type
    }

    /// Arguments of the chunk that introduced this item.
    pub fn args(&self) -> &Args {
        &self.data.args
    }

    /// Name of the server side processor that produced this item.
    pub fn processor_id(&self) -> Option<&str> {
        self.data.args.get("processor_id")
    }

    /// Wait for the item to complete and get its status. Returns
    /// [`Status::InProgress`] if `deadline` expires first.
    pub fn status(&self, deadline: impl Into<Deadline>) -> Status {
        self.data.wait_complete(deadline.into())
    }

    /// Wait until at least one data chunk of the item has arrived. Returns
    /// `false` if the item completed without data or `deadline` expired.
    pub fn wait_data(&self, deadline: impl Into<Deadline>) -> bool {
        self.data.wait_not_empty(deadline.into())
    }

    /// Take the oldest item message, if any.
    pub fn next_message(&self) -> Option<String> {
        self.data.lock().messages.pop_front()
    }

    /// Data chunks received so far, in chunk order. Chunks that have not
    /// arrived yet are empty.
    pub fn chunks(&self) -> Vec<Bytes> {
        self.data.lock().chunks.clone()
    }

    /// All data received so far, concatenated in chunk order.
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().chunks.concat()
    }

    /// The reply this item belongs to.
    pub fn reply(&self) -> Reply {
        Reply::new(self.reply.clone())
    }

    pub(crate) fn current_status(&self) -> Status {
        self.data.lock().status
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("type", &self.data.item_type)
            .field("args", &self.data.args.as_str())
            .finish()
    }
}
