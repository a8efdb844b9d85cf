use {
    crate::{ClientConfig, SessionError},
    bytes::Bytes,
    futures::{
        FutureExt, SinkExt, StreamExt,
        channel::{mpsc, oneshot},
    },
    rpgsync_io::transport::{CloseReason, LinkBackend, NO_STATUS_CLOSE_CODE, TransportEvent},
    tokio::net::TcpStream,
    tokio_tungstenite::{
        MaybeTlsStream,
        tungstenite::{
            Message, Utf8Bytes,
            handshake::client::Request,
            protocol::{CloseFrame, frame::coding::CloseCode},
        },
    },
    tracing::{debug, trace},
};

type WebSocketStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Drives one socket until it closes or the frontend asks it to.
pub async fn start(config: ClientConfig, request: Request, backend: LinkBackend) {
    let LinkBackend {
        send_event,
        mut recv_batch,
        mut recv_close,
        teardown,
    } = backend;

    debug!("Connecting to {}", request.uri());
    let connect = tokio_tungstenite::connect_async_tls_with_config(
        request,
        Some(config.socket),
        config.nodelay,
        Some(config.connector()),
    )
    .fuse();
    let mut connect = core::pin::pin!(connect);

    let stream = futures::select! {
        result = connect => match result {
            Ok((stream, _)) => Some(stream),
            Err(err) => {
                emit(&send_event, TransportEvent::Closed(CloseReason::by_error(
                    SessionError::Connect(err),
                )));
                None
            }
        },
        _ = recv_close => {
            debug!("Closed before the connection was established");
            None
        }
    };

    if let Some(mut stream) = stream {
        debug!("Connected");
        emit(&send_event, TransportEvent::Opened);
        if let Some(reason) = run(&mut stream, &send_event, &mut recv_batch, &mut recv_close).await {
            emit(&send_event, TransportEvent::Closed(reason));
        }
    }

    teardown.complete();
    debug!("Socket torn down");
}

fn emit(send_event: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) {
    // the frontend may have detached already
    _ = send_event.unbounded_send(event);
}

/// Pumps frames in both directions.
///
/// Returns [`None`] if the frontend asked to close the socket, in which case
/// there is no one left to report the reason to.
async fn run(
    stream: &mut WebSocketStream,
    send_event: &mpsc::UnboundedSender<TransportEvent>,
    recv_batch: &mut mpsc::UnboundedReceiver<Bytes>,
    mut recv_close: &mut oneshot::Receiver<()>,
) -> Option<CloseReason> {
    loop {
        futures::select! {
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Some(CloseReason::by_error(SessionError::RecvStreamClosed));
                };
                match msg {
                    Ok(Message::Binary(data)) => {
                        trace!(len = data.len(), "Received frame");
                        emit(send_event, TransportEvent::Recv(data));
                    }
                    Ok(Message::Text(text)) => {
                        debug!("Ignoring text frame of {} bytes", text.len());
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame.map_or_else(
                            || (NO_STATUS_CLOSE_CODE, String::new()),
                            |frame| (u16::from(frame.code), frame.reason.to_string()),
                        );
                        return Some(CloseReason::Peer { code, reason });
                    }
                    // pings are answered by tungstenite itself
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                    Err(err) => {
                        return Some(CloseReason::by_error(SessionError::Connection(err)));
                    }
                }
            }
            batch = recv_batch.next() => {
                let Some(batch) = batch else {
                    close(stream).await;
                    return None;
                };
                if let Err(err) = stream.send(Message::binary(batch)).await {
                    return Some(CloseReason::by_error(SessionError::Connection(err)));
                }
            }
            _ = recv_close => {
                close(stream).await;
                return None;
            }
        }
    }
}

async fn close(stream: &mut WebSocketStream) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from_static(""),
    };
    if let Err(err) = stream.close(Some(frame)).await {
        debug!("Failed to close socket cleanly: {err}");
    }
}
