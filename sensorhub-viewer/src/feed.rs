//! Live telemetry transport: the kernel's `/ws` endpoint driving a [`ViewerSession`].
//!
//! The handshake moves the session to `Live`; a close frame, end of stream or socket
//! error moves it to `Closed`.

use crate::session::{SessionError, ViewerSession};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct LiveFeed {
    socket: Socket,
}

impl LiveFeed {
    /// Opens `url`, e.g. `ws://localhost:3000/ws`.
    pub async fn connect(url: &str, session: &mut ViewerSession) -> Result<Self, SessionError> {
        match connect_async(url).await {
            Ok((socket, _)) => {
                session.on_connected()?;
                info!(%url, device = session.device(), "live feed open");
                Ok(Self { socket })
            }
            Err(e) => {
                warn!(%url, error = %e, "live feed handshake failed");
                session.close();
                Err(e.into())
            }
        }
    }

    /// Handles the next message from the kernel. `Ok(false)` once the feed has ended.
    pub async fn pump(&mut self, session: &mut ViewerSession) -> Result<bool, SessionError> {
        match self.socket.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = session.on_frame(text.as_str()) {
                    warn!(error = %e, "skipping frame");
                }
                Ok(true)
            }
            Some(Ok(Message::Close(_))) | None => {
                session.close();
                Ok(false)
            }
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => {
                session.close();
                Err(e.into())
            }
        }
    }

    /// Navigation away.
    pub async fn close(mut self, session: &mut ViewerSession) {
        if let Err(e) = self.socket.close(None).await {
            debug!(error = %e, "close handshake failed");
        }
        session.close();
    }
}

/// Feeds `session` from `url` until the kernel ends the stream or the transport fails.
pub async fn run(url: &str, session: &mut ViewerSession) -> Result<(), SessionError> {
    let mut feed = LiveFeed::connect(url, session).await?;
    while feed.pump(session).await? {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::DEFAULT_CAPACITY;
    use crate::session::SessionState;
    use futures::SinkExt;
    use tokio::net::TcpListener;

    /// Accepts one viewer, sends `frames`, then closes.
    async fn one_shot_kernel(frames: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for f in frames {
                ws.send(Message::text(f)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        });
        format!("ws://{addr}/ws")
    }

    #[tokio::test]
    async fn run_records_frames_until_the_kernel_closes() {
        let url = one_shot_kernel(vec![
            r#"{"deviceIdentifier":"Room1","temperature":21.5}"#,
            r#"{"deviceIdentifier":"Room2","temperature":30.0}"#,
            "garbage",
            r#"{"deviceIdentifier":"Room1","temperature":22.0}"#,
        ])
        .await;
        let mut session = ViewerSession::new("Room1", DEFAULT_CAPACITY);

        run(&url, &mut session).await.unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.history().values("temperature"), vec![21.5, 22.0]);
    }

    #[tokio::test]
    async fn failed_handshake_closes_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut session = ViewerSession::new("Room1", DEFAULT_CAPACITY);
        let err = run(&format!("ws://{addr}/ws"), &mut session).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(session.state(), SessionState::Closed);
    }
}
