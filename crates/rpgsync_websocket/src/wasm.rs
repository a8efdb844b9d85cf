use {
    crate::{JsError, OpenError, SessionError},
    bytes::Bytes,
    core::cell::RefCell,
    futures::{
        StreamExt,
        channel::{mpsc, oneshot},
    },
    js_sys::Uint8Array,
    rpgsync_io::transport::{CloseReason, LinkBackend, TeardownSignal, TransportEvent},
    std::rc::Rc,
    tracing::{debug, trace},
    wasm_bindgen::{JsCast, prelude::Closure},
    web_sys::{BinaryType, CloseEvent, ErrorEvent, MessageEvent, WebSocket},
};

// https://www.rfc-editor.org/rfc/rfc6455.html#section-7.4.1
const NORMAL_CLOSE_CODE: u16 = 1000;

const PROTOCOL: &str = "binary";

/// Half of a browser socket which forwards outgoing batches.
///
/// Incoming events are forwarded by the socket's callbacks, which are
/// registered in [`open`].
#[derive(Debug)]
pub struct SendLoop {
    socket: WebSocket,
    recv_batch: mpsc::UnboundedReceiver<Bytes>,
    recv_close: oneshot::Receiver<()>,
    teardown: Rc<RefCell<Option<TeardownSignal>>>,
}

/// Creates the browser socket and wires its callbacks into `backend`.
pub fn open(uri: &str, backend: LinkBackend) -> Result<SendLoop, OpenError> {
    let socket = WebSocket::new_with_str(uri, PROTOCOL)
        .map_err(JsError::from)
        .map_err(OpenError::CreateSocket)?;
    socket.set_binary_type(BinaryType::Arraybuffer);

    let LinkBackend {
        send_event,
        recv_batch,
        recv_close,
        teardown,
    } = backend;
    // completed by `onclose`, or by the send loop once it detaches the callbacks
    let teardown = Rc::new(RefCell::new(Some(teardown)));

    let on_open = Closure::<dyn FnMut()>::new({
        let send_event = send_event.clone();
        move || {
            debug!("Connected");
            _ = send_event.unbounded_send(TransportEvent::Opened);
        }
    });

    let on_message = Closure::<dyn FnMut(_)>::new({
        let send_event = send_event.clone();
        move |event: MessageEvent| {
            let data = event.data();
            if data.as_string().is_some() {
                debug!("Ignoring text frame");
                return;
            }
            let frame = Bytes::from(Uint8Array::new(&data).to_vec());
            trace!(len = frame.len(), "Received frame");
            _ = send_event.unbounded_send(TransportEvent::Recv(frame));
        }
    });

    let on_close = Closure::<dyn FnMut(_)>::new({
        let send_event = send_event.clone();
        let teardown = teardown.clone();
        move |event: CloseEvent| {
            let reason = CloseReason::Peer {
                code: event.code(),
                reason: event.reason(),
            };
            _ = send_event.unbounded_send(TransportEvent::Closed(reason));
            complete(&teardown);
        }
    });

    let on_error = Closure::<dyn FnMut(_)>::new(move |event: ErrorEvent| {
        let err = SessionError::Connection(JsError::new(event.message()));
        _ = send_event.unbounded_send(TransportEvent::Closed(CloseReason::by_error(err)));
    });

    socket.set_onopen(Some(on_open.as_ref().unchecked_ref()));
    on_open.forget();

    socket.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
    on_message.forget();

    socket.set_onclose(Some(on_close.as_ref().unchecked_ref()));
    on_close.forget();

    socket.set_onerror(Some(on_error.as_ref().unchecked_ref()));
    on_error.forget();

    Ok(SendLoop {
        socket,
        recv_batch,
        recv_close,
        teardown,
    })
}

fn complete(teardown: &RefCell<Option<TeardownSignal>>) {
    if let Some(teardown) = teardown.borrow_mut().take() {
        teardown.complete();
    }
}

fn detach(socket: &WebSocket) {
    socket.set_onopen(None);
    socket.set_onmessage(None);
    socket.set_onclose(None);
    socket.set_onerror(None);
}

impl SendLoop {
    /// Sends batches until the frontend closes the link.
    pub async fn start(self) {
        let Self {
            socket,
            mut recv_batch,
            mut recv_close,
            teardown,
        } = self;

        loop {
            let batch = futures::select! {
                batch = recv_batch.next() => batch,
                _ = recv_close => None,
            };
            let Some(batch) = batch else {
                break;
            };

            if let Err(err) = socket.send_with_u8_array(&batch) {
                debug!("Failed to send batch: {}", JsError::from(err));
            }
        }

        // the frontend is gone, so nothing the socket reports from here on can
        // reach it
        detach(&socket);
        _ = socket.close_with_code(NORMAL_CLOSE_CODE);
        complete(&teardown);
        debug!("Socket detached");
    }
}
