// ===============================
// src/transport.rs (socket seam)
// ===============================
//
// The connection manager only needs "open", "next text frame", "send text" and
// "close". `WsTransport` provides them over tokio-tungstenite; tests plug in a
// scripted transport.
//
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Peer closed; carries "code: reason" when the peer sent one.
    Closed(Option<String>),
}

pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;

    fn open(&self, url: &Url) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

pub trait Connection: Send + 'static {
    /// Next inbound item; `None` once the stream has ended.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Inbound, TransportError>>> + Send;

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct WsTransport;

pub struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for WsTransport {
    type Conn = WsConnection;

    async fn open(&self, url: &Url) -> Result<WsConnection, TransportError> {
        let (ws, _resp) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(WsConnection { ws })
    }
}

impl Connection for WsConnection {
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            let msg = match self.ws.next().await? {
                Ok(m) => m,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(TransportError::Read(e.to_string()))),
            };
            match msg {
                Message::Text(t) => return Some(Ok(Inbound::Text(t))),
                Message::Binary(b) => match String::from_utf8(b) {
                    Ok(t) => return Some(Ok(Inbound::Text(t))),
                    Err(e) => warn!(?e, "binary frame is not UTF-8, ignored"),
                },
                Message::Close(frame) => {
                    let reason = frame.map(|f| format!("code {}: {}", f.code, f.reason));
                    return Some(Ok(Inbound::Closed(reason)));
                }
                // ping/pong are answered by tungstenite
                other => debug!(kind = ?other, "control frame"),
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(?e, "close handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};

    /// One-shot feed server: pushes a fixed sequence, waits for one text from
    /// the client, then closes with a reason.
    async fn feed_server() -> (Url, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/feed", listener.local_addr().unwrap())).unwrap();
        let (got_tx, got_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"590423106":{"balance":1.0}}"#.into())).await.unwrap();
            ws.send(Message::Binary(br#"{"590454233":{"equity":2.0}}"#.to_vec())).await.unwrap();
            ws.send(Message::Binary(vec![0xff, 0xfe, 0xfd])).await.unwrap();
            ws.send(Message::Ping(b"hb".to_vec())).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(t) = msg {
                    let _ = got_tx.send(t);
                    break;
                }
            }
            let frame = CloseFrame { code: CloseCode::Normal, reason: "maintenance".into() };
            ws.send(Message::Close(Some(frame))).await.unwrap();
            // drain until the client answers the close
            while let Some(Ok(_)) = ws.next().await {}
        });
        (url, got_rx)
    }

    #[tokio::test]
    async fn text_binary_control_and_close_frames() {
        let (url, got) = feed_server().await;
        let mut conn = WsTransport.open(&url).await.unwrap();

        assert_eq!(
            conn.recv().await.unwrap().unwrap(),
            Inbound::Text(r#"{"590423106":{"balance":1.0}}"#.into())
        );
        assert_eq!(
            conn.recv().await.unwrap().unwrap(),
            Inbound::Text(r#"{"590454233":{"equity":2.0}}"#.into())
        );

        conn.send_text(r#"{"request_account":"590423106"}"#.into()).await.unwrap();
        assert_eq!(got.await.unwrap(), r#"{"request_account":"590423106"}"#);

        // non-UTF-8 binary and the ping are skipped on the way to the close
        match conn.recv().await.unwrap().unwrap() {
            Inbound::Closed(Some(reason)) => {
                assert!(reason.starts_with("code 1000"), "{reason}");
                assert!(reason.ends_with("maintenance"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_against_closed_port_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/feed", listener.local_addr().unwrap())).unwrap();
        drop(listener);

        assert!(matches!(WsTransport.open(&url).await, Err(TransportError::Connect(_))));
    }
}
