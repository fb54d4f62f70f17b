use psg_client::{Config, NextItem, Queue, Request, Status};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};
use testserver::{mock, ClosingServer, ReplyBody};

mod common;

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn failed_connections_are_retried_until_budget_runs_out() {
    let server = ClosingServer::new();
    let queue = common::queue(&[server.addr()], Config::default().request_retries(2));

    let reply = queue
        .send_request_and_get_reply(Request::new("/ID/resolve"), TIMEOUT)
        .unwrap();

    assert_eq!(reply.status(TIMEOUT), Status::Error);

    let message = reply.next_message().unwrap();
    assert!(message.starts_with("transport error:"), "{}", message);
    assert_eq!(reply.next_message(), None);

    thread::sleep(Duration::from_millis(200));
    assert_eq!(server.connections(), 3);
}

#[test]
fn reset_streams_are_retried() {
    let m = mock! {
        reset: 7,
    };

    let queue = common::queue(&[m.addr()], Config::default().request_retries(1));
    let reply = queue
        .send_request_and_get_reply(Request::new("/ID/resolve"), TIMEOUT)
        .unwrap();

    assert_eq!(reply.status(TIMEOUT), Status::Error);
    assert_eq!(
        reply.next_message().as_deref(),
        Some("http2 error: REFUSED_STREAM (7)")
    );
    assert_eq!(m.requests_received(), 2);

    // Both attempts shared one connection.
    assert_eq!(m.connections(), 1);
}

#[test]
fn slow_requests_time_out() {
    let m = mock! {
        delay: 5s,
        body: ReplyBody::new().build(),
    };

    let queue = common::queue(
        &[m.addr()],
        Config::default().request_timeout(1).request_retries(0),
    );
    let reply = queue
        .send_request_and_get_reply(Request::new("/ID/resolve"), TIMEOUT)
        .unwrap();

    assert_eq!(reply.status(Duration::from_secs(4)), Status::Error);
    assert_eq!(
        reply.next_message().as_deref(),
        Some("error: request timeout (timeout)")
    );
}

#[test]
fn requests_fail_without_servers() {
    let queue = common::queue(&[], Config::default().request_retries(1));
    let reply = queue
        .send_request_and_get_reply(Request::new("/ID/resolve"), TIMEOUT)
        .unwrap();

    assert_eq!(reply.status(TIMEOUT), Status::Error);
    assert_eq!(
        reply.next_message().as_deref(),
        Some("error: no servers available (discovery)")
    );
}

#[test]
fn requests_fan_out_over_small_queues() {
    common::setup();

    let m = mock! {
        body: ReplyBody::new().item(1, "bioseq_info", "info").build(),
    };

    let queue = Queue::builder(psg_client::StaticServers::new(vec![m.addr()]))
        .config(
            Config::default()
                .num_io(3)
                .max_queue_size(2)
                .requests_per_io(2),
        )
        .build()
        .unwrap();

    for i in 0..50 {
        queue
            .send_request(
                Request::new("/ID/resolve").arg("seq_id", &i.to_string()),
                TIMEOUT,
            )
            .unwrap();
    }

    for _ in 0..50 {
        let reply = queue.next_reply(TIMEOUT).unwrap();

        assert_eq!(reply.status(TIMEOUT), Status::Success);
        assert!(matches!(reply.next_item(TIMEOUT), NextItem::Item(_)));
    }

    assert_eq!(m.requests_received(), 50);
}

#[test]
fn rebalance_follows_discovery() {
    common::setup();

    let first = mock! {
        body: ReplyBody::new().build(),
    };
    let second = mock! {
        body: ReplyBody::new().build(),
    };

    let servers = Arc::new(Mutex::new(vec![first.addr()]));
    let discovery = {
        let servers = servers.clone();
        move || -> io::Result<Vec<SocketAddr>> { Ok(servers.lock().unwrap().clone()) }
    };

    let queue = Queue::builder(discovery)
        .config(
            Config::default()
                .num_io(1)
                .rebalance_time(Duration::from_millis(100)),
        )
        .build()
        .unwrap();

    let send = || {
        let reply = queue
            .send_request_and_get_reply(Request::new("/ID/resolve"), TIMEOUT)
            .unwrap();
        assert_eq!(reply.status(TIMEOUT), Status::Success);
    };

    send();
    assert_eq!((first.requests_received(), second.requests_received()), (1, 0));

    *servers.lock().unwrap() = vec![second.addr()];
    thread::sleep(Duration::from_millis(500));

    send();
    assert_eq!((first.requests_received(), second.requests_received()), (1, 1));
}
