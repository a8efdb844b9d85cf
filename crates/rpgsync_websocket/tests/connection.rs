#![cfg(not(target_family = "wasm"))]
#![expect(missing_docs, reason = "testing")]
#![expect(clippy::unwrap_used, reason = "testing")]

use {
    core::time::Duration,
    futures::{SinkExt, StreamExt},
    rpgsync_io::{
        connection::{Connection, ConnectionConfig, ConnectionState},
        dispatch::SystemMessage,
        framing::{HEADER_LEN, compute_header},
        transport::EXIT_CLOSE_CODE,
    },
    rpgsync_websocket::{
        ClientConfig, Security, WebSocketRuntime, WebSocketTransport,
        tokio_tungstenite::{
            self,
            tungstenite::{
                Message, Utf8Bytes,
                protocol::{CloseFrame, frame::coding::CloseCode},
            },
        },
    },
    std::{cell::RefCell, rc::Rc, sync::mpsc, thread},
    tokio::net::TcpListener,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts one client, reports its first binary frame, replies with a text
/// frame and a batch, then closes with `close_code`.
async fn serve(listener: TcpListener, close_code: u16, send_frame: mpsc::Sender<Vec<u8>>) {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

    let frame = loop {
        if let Message::Binary(data) = ws.next().await.unwrap().unwrap() {
            break data;
        }
    };
    send_frame.send(frame.to_vec()).unwrap();

    ws.send(Message::text(Utf8Bytes::from_static("ignored"))).await.unwrap();
    ws.send(Message::binary(
        "s\u{FFFF}1\u{FFFF}2\u{FFFE}hello".as_bytes().to_vec(),
    ))
    .await
    .unwrap();
    _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::from(close_code),
            reason: Utf8Bytes::from_static("bye"),
        }))
        .await;
    while let Some(Ok(_)) = ws.next().await {}
}

fn poll_until(
    conn: &mut Connection<WebSocketTransport>,
    mut done: impl FnMut(&Connection<WebSocketTransport>) -> bool,
) {
    let mut waited = Duration::ZERO;
    while waited < TIMEOUT {
        conn.poll();
        if done(conn) {
            return;
        }
        thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    panic!("timed out");
}

fn run_session(close_code: u16) -> Vec<SystemMessage> {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let addr = listener.local_addr().unwrap();
    let (send_frame, recv_frame) = mpsc::channel();
    rt.spawn(serve(listener, close_code, send_frame));

    let config = ClientConfig::builder()
        .with_security(Security::Plain)
        .build();
    let transport = WebSocketTransport::new(WebSocketRuntime::from(rt.handle().clone()), config);
    let mut conn = Connection::new(transport, ConnectionConfig::default());

    let events = Rc::new(RefCell::new(Vec::new()));
    for kind in [SystemMessage::Open, SystemMessage::Close, SystemMessage::Exit] {
        let events = events.clone();
        conn.on_system(kind, move || events.borrow_mut().push(kind));
    }
    let msgs = Rc::new(RefCell::new(Vec::new()));
    {
        let msgs = msgs.clone();
        conn.on_message("s", move |params| msgs.borrow_mut().push(params.join(",")));
    }
    let raw = Rc::new(RefCell::new(Vec::new()));
    {
        let raw = raw.clone();
        conn.on_raw(move |name, _| raw.borrow_mut().push(name.to_owned()));
    }

    conn.open(&format!("ws://{addr}"));
    poll_until(&mut conn, |conn| conn.is_connected());

    conn.set_key(7);
    conn.send(b"hello").unwrap();
    let frame = recv_frame.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(compute_header(b"", 7, 1, b"hello"), frame[..HEADER_LEN]);
    assert_eq!(b"hello", &frame[HEADER_LEN..]);

    poll_until(&mut conn, |conn| {
        matches!(conn.state(), ConnectionState::Closing { .. } | ConnectionState::Closed)
    });
    assert_eq!(vec!["1,2"], *msgs.borrow());
    assert_eq!(vec!["hello"], *raw.borrow());

    poll_until(&mut conn, |conn| conn.state() == ConnectionState::Closed);
    let dispatched = events.borrow().clone();
    dispatched
}

#[test]
fn exit_close_code_dispatches_exit() {
    assert_eq!(
        vec![SystemMessage::Open, SystemMessage::Exit],
        run_session(EXIT_CLOSE_CODE)
    );
}

#[test]
fn normal_close_code_dispatches_close() {
    assert_eq!(
        vec![SystemMessage::Open, SystemMessage::Close],
        run_session(1000)
    );
}
