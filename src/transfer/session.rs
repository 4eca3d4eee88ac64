//! Session drivers binding the transfer state machines to byte streams.
//!
//! Each driver is a single task: it parses envelopes from the reader, feeds
//! the state machine, and writes whatever the machine produces. The broker
//! driver writes through a bounded channel drained by a writer task, so a
//! slow terminal shows up as a full channel and a retry timer.

use crate::error::TransferError;
use crate::transfer::broker::{Flush, ReplyChannel, TerminalBroker, WriteOutcome};
use crate::transfer::envelope::{wrap, EnvelopeParser};
use crate::transfer::protocol::Message;
use crate::transfer::requestor::Requestor;
use crate::transfer::sender::Sender;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Capacity of the broker's reply channel, in envelopes.
pub const REPLY_CHANNEL_CAPACITY: usize = 64;

/// Asks the user whether a transfer may proceed.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn ask_yes_no(&self, message: &str) -> bool;
}

/// Answers every prompt the same way.
pub struct FixedAnswer(pub bool);

#[async_trait]
impl PermissionPrompt for FixedAnswer {
    async fn ask_yes_no(&self, _message: &str) -> bool {
        self.0
    }
}

/// The local side of a transfer, as seen by its driver.
pub trait Endpoint {
    fn start(&mut self);
    fn on_message(&mut self, msg: Message) -> crate::error::Result<()>;
    fn poll_outbound(&mut self) -> Option<Message>;
    fn cancel(&mut self);
    fn tick(&mut self, now: Instant) -> bool;
    /// When `tick` should next run.
    fn deadline(&self) -> Option<Instant>;
    fn is_finished(&self) -> bool;
}

impl Endpoint for Sender {
    fn start(&mut self) {
        Sender::start(self)
    }
    fn on_message(&mut self, msg: Message) -> crate::error::Result<()> {
        Sender::on_message(self, msg)
    }
    fn poll_outbound(&mut self) -> Option<Message> {
        Sender::poll_outbound(self)
    }
    fn cancel(&mut self) {
        Sender::cancel(self)
    }
    fn tick(&mut self, now: Instant) -> bool {
        Sender::tick(self, now)
    }
    fn deadline(&self) -> Option<Instant> {
        Sender::deadline(self)
    }
    fn is_finished(&self) -> bool {
        Sender::is_finished(self)
    }
}

impl Endpoint for Requestor {
    fn start(&mut self) {
        Requestor::start(self)
    }
    fn on_message(&mut self, msg: Message) -> crate::error::Result<()> {
        Requestor::on_message(self, msg)
    }
    fn poll_outbound(&mut self) -> Option<Message> {
        Requestor::poll_outbound(self)
    }
    fn cancel(&mut self) {
        Requestor::cancel(self)
    }
    fn tick(&mut self, now: Instant) -> bool {
        Requestor::tick(self, now)
    }
    fn deadline(&self) -> Option<Instant> {
        Requestor::cancel_deadline(self)
    }
    fn is_finished(&self) -> bool {
        Requestor::is_finished(self)
    }
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    writer
        .write_all(&wrap(&msg.serialize()))
        .await
        .context("Failed to write to terminal")?;
    Ok(())
}

/// Feed parsed envelopes to the endpoint.
fn deliver<E: Endpoint>(
    endpoint: &mut E,
    parser: &mut EnvelopeParser,
    buf: &[u8],
) -> crate::error::Result<()> {
    for payload in parser.feed(buf) {
        match Message::deserialize(&payload) {
            Ok(msg) => endpoint.on_message(msg)?,
            Err(e) => tracing::warn!("Dropping malformed reply: {}", e),
        }
    }
    Ok(())
}

/// Drive a sender or requestor until it finishes.
///
/// `cancel` resolving (for example on Ctrl-C) cancels the transfer; the
/// driver then waits for the terminal's confirmation or the grace period.
pub async fn run_endpoint<E, R, W, C>(
    endpoint: &mut E,
    mut reader: R,
    mut writer: W,
    cancel: C,
) -> Result<()>
where
    E: Endpoint,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: Future<Output = ()>,
{
    let mut parser = EnvelopeParser::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut cancel = std::pin::pin!(cancel.fuse());
    let mut canceled = false;

    endpoint.start();

    let outcome: crate::error::Result<()> = loop {
        if endpoint.is_finished() {
            break Ok(());
        }

        if let Some(msg) = endpoint.poll_outbound() {
            write_message(&mut writer, &msg).await?;
            // Replies may arrive while we stream, take what is ready
            if let Some(read) = reader.read(&mut buf).now_or_never() {
                let n = read.context("Failed to read from terminal")?;
                if n == 0 {
                    break Err(TransferError::protocol("Terminal closed the channel"));
                }
                if let Err(e) = deliver(endpoint, &mut parser, &buf[..n]) {
                    break Err(e);
                }
            }
            if !canceled && (&mut cancel).now_or_never().is_some() {
                canceled = true;
                endpoint.cancel();
            }
            continue;
        }
        writer.flush().await.context("Failed to flush to terminal")?;

        let deadline = endpoint.deadline();
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read.context("Failed to read from terminal")?;
                if n == 0 {
                    break Err(TransferError::protocol("Terminal closed the channel"));
                }
                if let Err(e) = deliver(endpoint, &mut parser, &buf[..n]) {
                    break Err(e);
                }
            }
            _ = &mut cancel, if !canceled => {
                canceled = true;
                tracing::info!("Canceling transfer");
                endpoint.cancel();
            }
            _ = timer => {
                endpoint.tick(Instant::now());
            }
        }
    };

    // Whatever the endpoint queued on the way out (finish, cancel) still goes
    while let Some(msg) = endpoint.poll_outbound() {
        write_message(&mut writer, &msg).await?;
    }
    writer.flush().await.context("Failed to flush to terminal")?;
    if canceled && outcome.is_ok() {
        return Err(TransferError::Canceled.into());
    }
    outcome.map_err(Into::into)
}

/// Reply channel backed by a bounded mpsc queue of framed envelopes.
pub struct MpscReplyChannel {
    tx: mpsc::Sender<Bytes>,
}

impl MpscReplyChannel {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ReplyChannel for MpscReplyChannel {
    fn try_write(&mut self, payload: &str) -> WriteOutcome {
        match self.tx.try_send(wrap(payload)) {
            Ok(()) => WriteOutcome::Written,
            Err(mpsc::error::TrySendError::Full(_)) => WriteOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Reply channel closed");
                WriteOutcome::Full
            }
        }
    }
}

/// Serve the terminal side of the protocol until the reader is exhausted.
///
/// A disconnect abandons whatever was in flight; leftovers are dropped with
/// the broker.
pub async fn run_broker<R, W>(
    mut broker: TerminalBroker,
    mut reader: R,
    mut writer: W,
    prompt: Arc<dyn PermissionPrompt>,
    sweep_interval: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(REPLY_CHANNEL_CAPACITY);
    let writer_handle = tokio::spawn(async move {
        let written = async {
            while let Some(bytes) = rx.recv().await {
                writer.write_all(&bytes).await?;
                if rx.is_empty() {
                    writer.flush().await?;
                }
            }
            writer.flush().await
        }
        .await;
        match written {
            // The local party hung up; its replies have nowhere to go
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::debug!("Terminal output closed: {}", e);
                Ok(())
            }
            other => other,
        }
    });

    let mut channel = MpscReplyChannel::new(tx);
    let mut parser = EnvelopeParser::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut prompts = FuturesUnordered::new();
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let retry_delay = broker.config().retry_delay;
    let mut retry_at: Option<tokio::time::Instant> = None;

    loop {
        for request in broker.take_permission_requests() {
            let prompt = prompt.clone();
            prompts.push(async move {
                let allowed = prompt.ask_yes_no(&request.prompt).await;
                (request.transfer_id, allowed)
            });
        }
        if retry_at.is_none() && broker.has_pending_output() {
            if broker.flush(&mut channel) == Flush::Blocked {
                retry_at = Some(tokio::time::Instant::now() + retry_delay);
            }
        }

        let retry = async move {
            match retry_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read.context("Failed to read from terminal")?;
                if n == 0 {
                    tracing::debug!("Channel closed, {} transfers abandoned", broker.transfer_count());
                    break;
                }
                let now = Instant::now();
                for payload in parser.feed(&buf[..n]) {
                    broker.handle_payload(&payload, now);
                }
            }
            Some((id, allowed)) = prompts.next(), if !prompts.is_empty() => {
                broker.permission_resolved(&id, allowed, Instant::now());
            }
            _ = sweep.tick() => {
                let expired = broker.sweep(Instant::now());
                if expired > 0 {
                    tracing::debug!("Expired {} idle transfers", expired);
                }
            }
            _ = retry => {
                retry_at = None;
            }
        }
    }

    // Deliver the replies already queued before hanging up
    broker.abandon_all();
    while broker.has_pending_output() && !channel.is_closed() {
        if broker.flush(&mut channel) == Flush::Blocked {
            tokio::time::sleep(retry_delay).await;
        }
    }
    drop(channel);
    writer_handle
        .await
        .context("Writer task panicked")?
        .context("Failed to write to terminal")?;
    Ok(())
}
