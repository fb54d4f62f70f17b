use psg_client::{Config, EventLoop, Item, Reply, Request, Status};
use std::{
    cell::RefCell,
    time::{Duration, Instant},
};
use testserver::{mock, ReplyBody};

mod common;

fn tag(reply: &Reply) -> u32 {
    *reply.user_context::<u32>().unwrap()
}

#[test]
fn callbacks_report_items_before_their_reply() {
    let m = mock! {
        body: ReplyBody::new()
            .item(1, "bioseq_info", "info")
            .item(2, "blob_prop", "props")
            .build(),
    };

    let events = RefCell::new(Vec::new());
    let mut event_loop = EventLoop::new(
        common::queue(&[m.addr()], Config::default()),
        |status: Status, item: &Item| {
            events
                .borrow_mut()
                .push((tag(&item.reply()), format!("{:?} {}", item.item_type(), status)))
        },
        |status: Status, reply: &Reply| {
            events
                .borrow_mut()
                .push((tag(reply), format!("reply {}", status)))
        },
    );

    for i in 0..2u32 {
        event_loop
            .send_request(Request::new("/ID/get").user_context(i), Duration::from_secs(5))
            .unwrap();
    }

    let start = Instant::now();

    while events.borrow().iter().filter(|(_, e)| e.starts_with("reply")).count() < 2 {
        assert!(start.elapsed() < Duration::from_secs(10), "replies never completed");
        assert!(event_loop.run_once(Duration::from_millis(100)));
    }

    event_loop.stop();
    while event_loop.run_once(Duration::from_millis(100)) {}
    drop(event_loop);

    let events = events.into_inner();

    for tag in 0..2 {
        let of_reply: Vec<_> = events
            .iter()
            .filter(|(t, _)| *t == tag)
            .map(|(_, e)| e.as_str())
            .collect();

        assert_eq!(
            of_reply,
            ["BioseqInfo success", "BlobProp success", "reply success"]
        );
    }
}
