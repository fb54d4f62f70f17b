use psg_client::{
    Config, DiagContext, ItemType, NextItem, Queue, Request, RequestContext, StaticServers,
    Status, UseCache,
};
use std::time::Duration;
use testserver::{mock, ReplyBody};

mod common;

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn single_item_reply() {
    let body = ReplyBody::new().item(1, "blob_prop", "props").build();
    let m = mock! {
        body: body,
    };

    let queue = common::queue(&[m.addr()], Config::default());

    queue
        .send_request(
            Request::new("/ID/getblob").arg("blob_id", "1.2"),
            TIMEOUT,
        )
        .unwrap();

    let reply = queue.next_reply(TIMEOUT).unwrap();

    let item = match reply.next_item(TIMEOUT) {
        NextItem::Item(item) => item,
        other => panic!("expected an item, got {:?}", other),
    };

    assert_eq!(item.item_type(), &ItemType::BlobProp);
    assert_eq!(item.status(TIMEOUT), Status::Success);
    assert_eq!(item.data(), b"props");
    assert!(matches!(reply.next_item(TIMEOUT), NextItem::EndOfReply));
    assert_eq!(reply.status(TIMEOUT), Status::Success);
    assert_eq!(reply.next_message(), None);

    assert_eq!(m.requests_received(), 1);
}

#[test]
fn request_carries_diagnostic_headers() {
    let m = mock! {
        body: ReplyBody::new().build(),
    };

    let queue = Queue::builder(StaticServers::new(vec![m.addr()]))
        .config(Config::default().num_io(1).use_cache(UseCache::No))
        .diag_context(DiagContext::new().application("tester", "1.0"))
        .build()
        .unwrap();

    let context = RequestContext::new("my-session", "my-hit").with_client_ip([10, 0, 0, 1].into());
    let reply = queue
        .send_request_and_get_reply(
            Request::new("/ID/resolve")
                .arg("seq_id", "NC_000001")
                .context(context),
            TIMEOUT,
        )
        .unwrap();

    assert_eq!(reply.status(TIMEOUT), Status::Success);

    let request = m.request();

    assert_eq!(request.method, "GET");
    assert!(request.path.starts_with("/ID/resolve?seq_id=NC_000001&"));
    assert_eq!(request.query_param("use_cache"), Some("no"));
    assert_eq!(
        request.query_param("client_id").map(str::to_owned),
        Some(queue.coordinator().diag_context().client_id().to_owned())
    );
    request.expect_header_regex("user-agent", r"^tester/1\.0 psg-client/");
    request.expect_header("http_ncbi_sid", "my-session");
    request.expect_header("http_ncbi_phid", "my-hit.1");
    request.expect_header("x-forwarded-for", "10.0.0.1");
}

#[test]
fn not_found_status() {
    let m = mock! {
        status: 404,
    };

    let queue = common::queue(&[m.addr()], Config::default());
    let reply = queue
        .send_request_and_get_reply(Request::new("/ID/get").arg("seq_id", "none"), TIMEOUT)
        .unwrap();

    assert_eq!(reply.status(TIMEOUT), Status::NotFound);
    assert!(matches!(reply.next_item(TIMEOUT), NextItem::EndOfReply));
}

#[test]
fn server_error_status() {
    let m = mock! {
        status: 500,
    };

    let queue = common::queue(&[m.addr()], Config::default());
    let reply = queue
        .send_request_and_get_reply(Request::new("/ID/get"), TIMEOUT)
        .unwrap();

    assert_eq!(reply.status(TIMEOUT), Status::Error);
    assert_eq!(
        reply.next_message().as_deref(),
        Some("500 Internal Server Error")
    );

    // The server answered, so there is nothing to retry.
    assert_eq!(m.requests_received(), 1);
}

#[test]
fn reply_error_message() {
    let body = ReplyBody::new()
        .message("error", "Bad seq_id")
        .build();
    let m = mock! {
        body: body,
    };

    let queue = common::queue(&[m.addr()], Config::default());
    let reply = queue
        .send_request_and_get_reply(Request::new("/ID/resolve"), TIMEOUT)
        .unwrap();

    assert_eq!(reply.status(TIMEOUT), Status::Error);
    assert_eq!(reply.next_message().as_deref(), Some("Bad seq_id"));
    assert!(matches!(reply.next_item(TIMEOUT), NextItem::EndOfReply));
}

#[test]
fn truncated_reply_fails_items() {
    let body = ReplyBody::new()
        .chunk("item_id=1&item_type=blob&chunk_type=meta&n_chunks=3", "")
        .chunk("item_id=1&item_type=blob&chunk_type=data&blob_chunk=0", "part")
        .unfinished();
    let m = mock! {
        body: body,
    };

    let queue = common::queue(&[m.addr()], Config::default());
    let reply = queue
        .send_request_and_get_reply(Request::new("/ID/getblob"), TIMEOUT)
        .unwrap();

    let item = match reply.next_item(TIMEOUT) {
        NextItem::Item(item) => item,
        other => panic!("expected an item, got {:?}", other),
    };

    assert_eq!(item.item_type(), &ItemType::Blob);
    assert_eq!(item.status(TIMEOUT), Status::Error);
    assert_eq!(
        item.next_message().as_deref(),
        Some("Protocol error: received less than expected")
    );
}

#[test]
fn items_of_one_reply_are_kept_apart() {
    let body = ReplyBody::new()
        .item(1, "bioseq_info", "info")
        .item(2, "blob_prop", "props")
        .chunk("item_id=3&item_type=blob&reason=excluded&chunk_type=meta&n_chunks=1", "")
        .build();
    let m = mock! {
        body: body,
    };

    let queue = common::queue(&[m.addr()], Config::default());
    let reply = queue
        .send_request_and_get_reply(Request::new("/ID/get"), TIMEOUT)
        .unwrap();

    assert_eq!(reply.status(TIMEOUT), Status::Success);

    let mut items = Vec::new();

    while let NextItem::Item(item) = reply.next_item(TIMEOUT) {
        assert_eq!(item.status(TIMEOUT), Status::Success);
        items.push((item.item_type().clone(), item.data()));
    }

    assert_eq!(
        items,
        [
            (ItemType::BioseqInfo, b"info".to_vec()),
            (ItemType::BlobProp, b"props".to_vec()),
            (
                ItemType::SkippedBlob(psg_client::SkipReason::Excluded),
                Vec::new()
            ),
        ]
    );
}
