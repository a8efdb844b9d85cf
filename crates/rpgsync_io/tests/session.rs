#![expect(missing_docs, reason = "testing")]
#![expect(clippy::unwrap_used, reason = "testing")]

use {
    rpgsync_io::{
        channel::ChannelTransport,
        connection::{Connection, ConnectionConfig, ConnectionState},
        dispatch::SystemMessage,
        framing::{HEADER_LEN, compute_header},
        packet::{MSG_DELIM, NamedPacket, parse_batch},
        queue::MAX_BATCH_LEN,
    },
    std::{cell::RefCell, rc::Rc},
};

#[test]
fn reconnect_after_close_uses_fresh_counter() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let mut conn = Connection::new(ChannelTransport::new(), ConnectionConfig::default());
    for kind in [SystemMessage::Open, SystemMessage::Close] {
        let events = events.clone();
        conn.on_system(kind, move || events.borrow_mut().push(kind));
    }

    conn.open("mem://one");
    let mut peer = conn.transport_mut().take_peer().unwrap();
    peer.accept();
    conn.poll();
    conn.set_key(42);
    conn.send(b"hello").unwrap();
    assert_eq!(
        compute_header(b"", 42, 1, b"hello"),
        peer.recv().unwrap()[..HEADER_LEN]
    );

    peer.close(1006, "abnormal");
    conn.poll();
    drop(peer);
    conn.poll();
    assert_eq!(ConnectionState::Closed, conn.state());

    // the session owner decides to reconnect
    conn.open("mem://two");
    let mut peer = conn.transport_mut().take_peer().unwrap();
    assert_eq!("mem://two", peer.uri());
    peer.accept();
    conn.poll();
    conn.send(b"again").unwrap();

    let frame = peer.recv().unwrap();
    assert_eq!(1u32.to_be_bytes(), frame[4..HEADER_LEN]);
    assert_eq!(
        vec![
            SystemMessage::Open,
            SystemMessage::Close,
            SystemMessage::Open
        ],
        *events.borrow()
    );
}

#[test]
fn large_backlog_is_split_into_capped_batches() {
    let mut conn = Connection::new(
        ChannelTransport::new(),
        ConnectionConfig::default().with_header(false),
    );
    conn.open("mem://backlog");
    let mut peer = conn.transport_mut().take_peer().unwrap();
    peer.accept();
    conn.poll();

    let text = "a".repeat(600);
    for i in 0..20 {
        conn.enqueue(&NamedPacket::new("say").param(i).param(&text))
            .unwrap();
    }
    conn.enqueue(&NamedPacket::new("sr").param(5)).unwrap();
    conn.flush_queue().unwrap();

    let mut batches = Vec::new();
    while let Some(batch) = peer.recv() {
        batches.push(batch);
    }
    assert!(batches.len() > 1);
    assert!(batches.iter().all(|batch| batch.len() <= MAX_BATCH_LEN));

    let last = batches.last().unwrap();
    assert_eq!(b"sr\xEF\xBF\xBF5", &last[..]);
    assert!(!last.windows(MSG_DELIM.len()).any(|w| w == MSG_DELIM.as_bytes()));

    let said = batches[..batches.len() - 1]
        .iter()
        .flat_map(|batch| {
            parse_batch(batch)
                .into_iter()
                .map(|msg| msg.params[0].parse::<u32>().unwrap())
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    assert_eq!((0..20).collect::<Vec<_>>(), said);
}
