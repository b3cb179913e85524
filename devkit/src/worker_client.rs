/*!
Worker simulator

Speaks the three worker protocols against a running kernel the way a real
supervised process does: one identity request, short-lived heartbeat
connections and one long-lived log stream.
*/

use crate::line_builder::LineBuilder;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr) -> Result<Socket> {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .with_context(|| format!("connect to {addr}"))?;
    Ok(ws)
}

#[derive(Debug, Clone)]
pub struct WorkerClient {
    pub name: String,
    identity: SocketAddr,
    heartbeat: SocketAddr,
    stream: SocketAddr,
    instance_id: Option<String>,
}

impl WorkerClient {
    pub fn new<S: Into<String>>(name: S, identity: SocketAddr, heartbeat: SocketAddr, stream: SocketAddr) -> Self {
        Self { name: name.into(), identity, heartbeat, stream, instance_id: None }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Asks the kernel for an instance id.
    pub async fn register(&mut self) -> Result<String> {
        let mut ws = connect(self.identity).await?;
        ws.send(Message::Text(self.name.clone().into())).await?;

        let id = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text.as_str().to_string(),
                Some(Ok(Message::Close(_))) | None => anyhow::bail!("identity channel closed without an id"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };
        let _ = ws.close(None).await;

        log::info!("[worker] {} registered as {id}", self.name);
        self.instance_id = Some(id.clone());
        Ok(id)
    }

    fn id(&self) -> Result<&str> {
        self.instance_id.as_deref().context("worker is not registered")
    }

    /// Sends one raw line on a fresh heartbeat connection.
    pub async fn send_heartbeat_line(&self, line: &str) -> Result<()> {
        let mut ws = connect(self.heartbeat).await?;
        ws.send(Message::Text(line.to_string().into())).await?;
        let _ = ws.close(None).await;
        // drain until the kernel acknowledges the close so the line is processed
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let line = LineBuilder::heartbeat(self.id()?);
        self.send_heartbeat_line(&line).await
    }

    pub async fn exit(&self) -> Result<()> {
        let line = LineBuilder::exit(self.id()?);
        self.send_heartbeat_line(&line).await
    }

    /// Opens the long-lived log stream.
    pub async fn open_stream(&self) -> Result<LogStream> {
        Ok(LogStream { app: self.name.clone(), ws: connect(self.stream).await? })
    }
}

pub struct LogStream {
    app: String,
    ws: Socket,
}

impl LogStream {
    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    pub async fn info(&mut self, message: &str) -> Result<()> {
        let line = LineBuilder::info(&self.app, message);
        self.send_raw(&line).await
    }

    pub async fn error(&mut self, message: &str) -> Result<()> {
        let line = LineBuilder::error(&self.app, message);
        self.send_raw(&line).await
    }

    pub async fn fatal(&mut self, message: &str) -> Result<()> {
        let line = LineBuilder::fatal(&self.app, message);
        self.send_raw(&line).await
    }

    /// True when the kernel closes the stream within `within`.
    pub async fn closed_by_kernel(&mut self, within: Duration) -> bool {
        let closed = async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        };
        tokio::time::timeout(within, closed).await.is_ok()
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
