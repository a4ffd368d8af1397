//! Message-passing boundary between the control surface and the engine.
//!
//! The channel numbers every request, validates it against the allow-list
//! and only then forwards it. Requests are handed to the engine one at a
//! time through a bounded queue; a request that cannot be queued yet waits
//! for room instead of being dropped.

use std::io;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, ToSocketAddrs,
    },
    sync::{broadcast, mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ErrorKind, GazeError},
    protocol::{self, Acknowledgement, Command, ReplyLine},
};

/// One validated command on its way into the engine.
#[derive(Debug)]
pub struct Envelope {
    pub seq: u64,
    pub command: Command,
    pub reply: oneshot::Sender<Acknowledgement>,
}

#[derive(Debug)]
pub struct CommandChannel {
    next_seq: u64,
    engine: mpsc::Sender<Envelope>,
}

impl CommandChannel {
    pub fn new(engine: mpsc::Sender<Envelope>) -> Self {
        Self {
            next_seq: 1,
            engine,
        }
    }

    /// A channel plus the receiving end the engine loop reads from.
    pub fn bounded(depth: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self::new(tx), rx)
    }

    /// Sequence number the next request will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Submits one request line and waits for its acknowledgement. Malformed
    /// requests are answered here and never reach the engine.
    pub async fn submit(&mut self, line: &str) -> Acknowledgement {
        let seq = self.next_seq;
        self.next_seq += 1;

        let command = match protocol::parse(line) {
            Ok(command) => command,
            Err(err) => {
                tracing::info!(seq, error = %err, "request rejected at the boundary");
                return Acknowledgement::error(seq, ErrorKind::ProtocolError, err.to_string());
            }
        };

        let (reply, response) = oneshot::channel();
        let envelope = Envelope {
            seq,
            command,
            reply,
        };
        if self.engine.send(envelope).await.is_err() {
            return Acknowledgement::failed(seq, &GazeError::msg("engine is not running"));
        }
        match response.await {
            Ok(ack) => ack,
            Err(_) => Acknowledgement::failed(seq, &GazeError::msg("engine dropped the request")),
        }
    }
}

/// Serves control connections one at a time until cancelled. Pushed notices
/// are written between acknowledgements.
pub async fn serve(
    listener: TcpListener,
    mut channel: CommandChannel,
    notices: broadcast::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "failed to accept control connection");
                continue;
            }
        };

        tracing::info!(%peer, "control surface connected");
        let subscription = notices.subscribe();
        match connection(stream, &mut channel, subscription, &cancel).await {
            Ok(()) => tracing::info!(%peer, "control surface disconnected"),
            Err(err) => tracing::warn!(%peer, error = %err, "control connection failed"),
        }
    }
    tracing::debug!("control listener stopped");
}

async fn connection(
    stream: TcpStream,
    channel: &mut CommandChannel,
    mut notices: broadcast::Receiver<String>,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                let ack = channel.submit(&line).await;
                write.write_all(format!("{ack}\n").as_bytes()).await?;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => write.write_all(format!("{notice}\n").as_bytes()).await?,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "control surface fell behind on notices");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// What came back for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub seq: u64,
    pub ok: bool,
    /// Acknowledgement text after the sequence number.
    pub text: String,
    /// Notices received while waiting.
    pub notices: Vec<String>,
}

/// The unprivileged side of the channel.
#[derive(Debug)]
pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    pub async fn request(&mut self, line: &str) -> io::Result<Reply> {
        self.write
            .write_all(format!("{}\n", line.trim_end()).as_bytes())
            .await?;

        let mut notices = Vec::new();
        loop {
            match self.read_line().await? {
                ReplyLine::Notice(notice) => notices.push(notice),
                ReplyLine::Ack { seq, ok, text } => {
                    return Ok(Reply {
                        seq,
                        ok,
                        text,
                        notices,
                    })
                }
            }
        }
    }

    /// Waits for the next pushed notice. Cancel-safe.
    pub async fn next_notice(&mut self) -> io::Result<String> {
        loop {
            if let ReplyLine::Notice(notice) = self.read_line().await? {
                return Ok(notice);
            }
        }
    }

    async fn read_line(&mut self) -> io::Result<ReplyLine> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "engine closed the connection",
                ));
            };
            match ReplyLine::classify(&line) {
                Some(reply) => return Ok(reply),
                None => tracing::debug!(%line, "ignoring unrecognised line from engine"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{error::ProtocolError, protocol::Outcome};

    /// Stand-in engine that acknowledges everything with its verb.
    fn echo_engine(mut rx: mpsc::Receiver<Envelope>) -> tokio::task::JoinHandle<Vec<u64>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(envelope) = rx.recv().await {
                seen.push(envelope.seq);
                let ack = Acknowledgement::ok_with(envelope.seq, envelope.command.verb());
                let _ = envelope.reply.send(ack);
            }
            seen
        })
    }

    #[tokio::test]
    async fn malformed_requests_never_reach_the_engine() {
        let (mut channel, rx) = CommandChannel::bounded(4);
        let engine = echo_engine(rx);

        let ack = channel.submit("recrod 30s").await;
        assert_eq!(ack.seq, 1);
        assert_eq!(
            ack.outcome,
            Outcome::Error {
                kind: ErrorKind::ProtocolError,
                detail: ProtocolError::UnknownVerb("recrod".into()).to_string(),
            }
        );
        assert_eq!(channel.next_seq(), 2);

        let ack = channel.submit("status").await;
        assert_eq!(ack, Acknowledgement::ok_with(2, "status"));

        drop(channel);
        assert_eq!(engine.await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn reports_a_missing_engine() {
        let (mut channel, rx) = CommandChannel::bounded(1);
        drop(rx);
        let ack = channel.submit("stop").await;
        assert!(!ack.is_ok());
        assert_eq!(ack.seq, 1);
    }

    #[tokio::test]
    async fn serves_requests_in_order_with_notices() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (channel, rx) = CommandChannel::bounded(4);
        let (notices, _) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let _engine = echo_engine(rx);
        let server = tokio::spawn(serve(listener, channel, notices.clone(), cancel.clone()));

        let mut client = ControlClient::connect(addr).await.unwrap();
        let first = client.request("show okn").await.unwrap();
        assert_eq!(
            first,
            Reply {
                seq: 1,
                ok: true,
                text: "ok show".into(),
                notices: Vec::new(),
            }
        );

        let bad = client.request("dance").await.unwrap();
        assert_eq!(bad.seq, 2);
        assert!(!bad.ok);
        assert!(bad.text.starts_with("error ProtocolError"));

        notices.send("* task-done".to_string()).unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(5), client.next_notice())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice, "task-done");

        let third = client.request("stop").await.unwrap();
        assert_eq!(third.seq, 3);

        cancel.cancel();
        server.await.unwrap();
    }
}
