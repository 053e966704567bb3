use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::server::commands::{Command, Event};

/// Build the control endpoint URL for `base`, appending `access_token` when given.
///
/// `base` may be `ws://host:port`, `ws://host:port/control` or an `http(s)://` URL.
pub fn control_url(base: &str, access_token: Option<&str>) -> Result<String> {
    let trimmed = base.trim().trim_end_matches('/');
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| anyhow!("missing scheme in url: {}", base))?;
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(anyhow!("unsupported scheme in url: {}", other)),
    };
    if rest.is_empty() {
        return Err(anyhow!("missing host in url: {}", base));
    }
    let mut url = if rest.contains('/') {
        format!("{}://{}", scheme, rest)
    } else {
        format!("{}://{}/control", scheme, rest)
    };
    if let Some(tok) = access_token.filter(|t| !t.is_empty()) {
        url.push_str(if url.contains('?') { "&" } else { "?" });
        url.push_str("access_token=");
        url.push_str(tok);
    }
    Ok(url)
}

/// One open control connection. Commands go out as JSON text frames; pushed
/// events arrive on the receiver returned by [`ControlSession::connect`].
pub struct ControlSession {
    url: String,
    outbound: UnboundedSender<Command>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ControlSession {
    pub async fn connect(base: &str, access_token: Option<&str>) -> Result<(Self, UnboundedReceiver<Event>)> {
        let url = control_url(base, access_token)?;
        let (stream, _resp) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("connect {}", base))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = unbounded_channel::<Command>();
        let writer = tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                let text = match serde_json::to_string(&cmd) {
                    Ok(t) => t,
                    Err(e) => { debug!("command encode failed: {}", e); continue; }
                };
                if sink.send(Message::Text(text)).await.is_err() { break; }
            }
            let _ = sink.close().await;
        });

        let (ev_tx, ev_rx) = unbounded_channel::<Event>();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Event>(&text) {
                        Ok(ev) => { if ev_tx.send(ev).is_err() { break; } }
                        Err(e) => debug!("ignored unknown event: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => { debug!("socket error: {}", e); break; }
                }
            }
        });

        Ok((Self { url, outbound: out_tx, writer, reader }, ev_rx))
    }

    pub fn send(&self, cmd: Command) -> Result<()> {
        self.outbound.send(cmd).map_err(|_| anyhow!("connection closed"))
    }

    pub fn is_open(&self) -> bool { !self.reader.is_finished() && !self.outbound.is_closed() }

    /// Endpoint without the token query.
    pub fn ident(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }

    /// Drop the outbound queue so the writer sends a close frame, then stop reading.
    pub async fn close(self) {
        let ControlSession { outbound, writer, reader, .. } = self;
        drop(outbound);
        let _ = writer.await;
        reader.abort();
    }
}
