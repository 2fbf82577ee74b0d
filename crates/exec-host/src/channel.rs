//! Host-side endpoint of the worker protocol.
//!
//! ## Connection Flow
//!
//! 1. Worker starts and sends `ready`
//! 2. Host sends `ping`, waits for `pong` with the same seq
//! 3. Connection established: host sends `exec` and waits for `exec_result`
//!
//! Only one request is outstanding at a time; responses are matched by seq.

use std::time::Duration;

use sandbox::{ExecutionRequest, ExecutionResult, Result, SandboxError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant};
use worker_proto::{
    Decoder, MSG_ERROR, MSG_EXEC, MSG_EXEC_RESULT, MSG_PING, MSG_PONG, MSG_READY, MSG_SHUTDOWN,
    MSG_SHUTDOWN_ACK, ProtocolError, RawMessage,
};

const READ_BUF_SIZE: usize = 64 * 1024;

fn protocol_error(e: ProtocolError) -> SandboxError {
    SandboxError::Protocol(e.to_string())
}

/// Framed connection to one worker over any async byte stream pair.
pub struct WorkerChannel<R, W> {
    reader: R,
    writer: W,
    decoder: Decoder,
    next_seq: u32,
    /// Reusable read buffer (avoids inflating async Future size).
    read_buf: Box<[u8; READ_BUF_SIZE]>,
}

impl<R, W> WorkerChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a stream pair and perform the ready/ping/pong handshake.
    pub async fn connect(reader: R, writer: W, timeout: Duration) -> Result<Self> {
        let mut channel = Self {
            reader,
            writer,
            decoder: Decoder::new(),
            next_seq: 1,
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
        };
        let deadline = Instant::now() + timeout;
        channel
            .handshake(deadline)
            .await
            .map_err(|e| SandboxError::HandshakeFailed(e.to_string()))?;
        Ok(channel)
    }

    async fn handshake(&mut self, deadline: Instant) -> Result<()> {
        self.read_until(Some(deadline), |m| m.msg_type == MSG_READY)
            .await?;
        self.ping_until(deadline).await
    }

    /// Read one batch of messages. `None` waits indefinitely.
    async fn read_batch(&mut self, deadline: Option<Instant>) -> Result<Vec<RawMessage>> {
        let read = self.reader.read(self.read_buf.as_mut());
        let n = match deadline {
            Some(deadline) => time::timeout_at(deadline, read)
                .await
                .map_err(|_| SandboxError::Protocol("read timed out".into()))??,
            None => read.await?,
        };

        if n == 0 {
            return Err(SandboxError::WorkerExited);
        }

        self.decoder
            // n <= read_buf.len() is guaranteed by read()
            .decode(self.read_buf.get(..n).unwrap_or_default())
            .map_err(protocol_error)
    }

    /// Read messages until one matches the predicate. Non-matching
    /// messages are dropped.
    async fn read_until(
        &mut self,
        deadline: Option<Instant>,
        predicate: impl Fn(&RawMessage) -> bool,
    ) -> Result<RawMessage> {
        loop {
            for msg in self.read_batch(deadline).await? {
                if predicate(&msg) {
                    return Ok(msg);
                }
            }
        }
    }

    /// Get next sequence number, wrapping around and skipping 0.
    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        seq
    }

    /// Send a request and wait for the response carrying the same seq.
    async fn request(
        &mut self,
        msg_type: u8,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<RawMessage> {
        let seq = self.next_seq();
        let frame = worker_proto::encode(msg_type, seq, payload).map_err(protocol_error)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        self.read_until(deadline, |m| m.seq == seq).await
    }

    async fn ping_until(&mut self, deadline: Instant) -> Result<()> {
        let resp = self.request(MSG_PING, &[], Some(deadline)).await?;
        if resp.msg_type != MSG_PONG {
            return Err(unexpected(&resp));
        }
        Ok(())
    }

    /// Round-trip a `ping`.
    pub async fn ping(&mut self, timeout: Duration) -> Result<()> {
        self.ping_until(Instant::now() + timeout).await
    }

    /// Run one request on the worker.
    ///
    /// Waits without a deadline: the caller owns the time budget and drops
    /// this future (and then the worker) when it runs out.
    pub async fn exec(&mut self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let payload = worker_proto::encode_exec(request).map_err(protocol_error)?;
        let resp = self.request(MSG_EXEC, &payload, None).await?;

        match resp.msg_type {
            MSG_EXEC_RESULT => {
                let result =
                    worker_proto::decode_exec_result(&resp.payload).map_err(protocol_error)?;
                if result.id != request.id {
                    return Err(SandboxError::Protocol(format!(
                        "result id {} does not match request id {}",
                        result.id, request.id
                    )));
                }
                Ok(result)
            }
            MSG_ERROR => {
                let msg = worker_proto::decode_error(&resp.payload).map_err(protocol_error)?;
                Err(SandboxError::Remote(msg.to_owned()))
            }
            _ => Err(unexpected(&resp)),
        }
    }

    /// Request graceful shutdown.
    ///
    /// Returns `true` if the worker acknowledged, `false` on timeout or error.
    pub async fn shutdown(&mut self, timeout: Duration) -> bool {
        let result = self
            .request(MSG_SHUTDOWN, &[], Some(Instant::now() + timeout))
            .await;
        matches!(result, Ok(ref m) if m.msg_type == MSG_SHUTDOWN_ACK)
    }
}

fn unexpected(msg: &RawMessage) -> SandboxError {
    SandboxError::Protocol(format!(
        "unexpected response type: 0x{:02X} ({})",
        msg.msg_type,
        worker_proto::type_name(msg.msg_type)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::{ErrorKind, LogEntry, LogKind};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Channel = WorkerChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    /// Read the next frame on the fake worker side.
    async fn next_frame(stream: &mut DuplexStream, decoder: &mut Decoder) -> RawMessage {
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "host closed the stream");
            if let Some(msg) = decoder.decode(&buf[..n]).unwrap().into_iter().next() {
                return msg;
            }
        }
    }

    async fn send(stream: &mut DuplexStream, msg_type: u8, seq: u32, payload: &[u8]) {
        let frame = worker_proto::encode(msg_type, seq, payload).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    /// Fake worker side of the handshake.
    async fn accept(stream: &mut DuplexStream, decoder: &mut Decoder) {
        send(stream, MSG_READY, 0, &[]).await;
        let ping = next_frame(stream, decoder).await;
        assert_eq!(ping.msg_type, MSG_PING);
        send(stream, MSG_PONG, ping.seq, &[]).await;
    }

    async fn connect(host_side: DuplexStream) -> Result<Channel> {
        let (reader, writer) = tokio::io::split(host_side);
        WorkerChannel::connect(reader, writer, Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn exec_returns_matching_result() {
        let (host_side, mut worker) = tokio::io::duplex(64 * 1024);

        let fake = tokio::spawn(async move {
            let mut decoder = Decoder::new();
            accept(&mut worker, &mut decoder).await;
            let exec = next_frame(&mut worker, &mut decoder).await;
            assert_eq!(exec.msg_type, MSG_EXEC);
            let request = worker_proto::decode_exec(&exec.payload).unwrap();
            let result = ExecutionResult {
                id: request.id,
                logs: vec![LogEntry {
                    kind: LogKind::Log,
                    text: "2".into(),
                    timestamp_ms: 0.1,
                }],
                result: None,
                error: None,
                error_kind: None,
                duration_ms: 0.2,
                timeline: None,
            };
            let payload = worker_proto::encode_exec_result(&result).unwrap();
            send(&mut worker, MSG_EXEC_RESULT, exec.seq, &payload).await;
        });

        let mut channel = connect(host_side).await.unwrap();
        let result = channel
            .exec(&ExecutionRequest::new("r1", "console.log(1+1)"))
            .await
            .unwrap();
        assert_eq!(result.id, "r1");
        assert_eq!(result.logs[0].text, "2");
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn stale_responses_are_skipped() {
        let (host_side, mut worker) = tokio::io::duplex(64 * 1024);

        let fake = tokio::spawn(async move {
            let mut decoder = Decoder::new();
            accept(&mut worker, &mut decoder).await;
            let exec = next_frame(&mut worker, &mut decoder).await;
            let request = worker_proto::decode_exec(&exec.payload).unwrap();
            let stale = ExecutionResult::failed("old", ErrorKind::Runtime, "old", 0.0);
            let payload = worker_proto::encode_exec_result(&stale).unwrap();
            send(&mut worker, MSG_EXEC_RESULT, exec.seq.wrapping_sub(1), &payload).await;
            let fresh = ExecutionResult::failed(request.id, ErrorKind::Runtime, "fresh", 0.0);
            let payload = worker_proto::encode_exec_result(&fresh).unwrap();
            send(&mut worker, MSG_EXEC_RESULT, exec.seq, &payload).await;
        });

        let mut channel = connect(host_side).await.unwrap();
        let result = channel.exec(&ExecutionRequest::new("r2", "x")).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("fresh"));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_result_id_is_a_protocol_error() {
        let (host_side, mut worker) = tokio::io::duplex(64 * 1024);

        let fake = tokio::spawn(async move {
            let mut decoder = Decoder::new();
            accept(&mut worker, &mut decoder).await;
            let exec = next_frame(&mut worker, &mut decoder).await;
            let other = ExecutionResult::failed("someone-else", ErrorKind::Runtime, "x", 0.0);
            let payload = worker_proto::encode_exec_result(&other).unwrap();
            send(&mut worker, MSG_EXEC_RESULT, exec.seq, &payload).await;
        });

        let mut channel = connect(host_side).await.unwrap();
        let err = channel.exec(&ExecutionRequest::new("mine", "x")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(_)), "{err}");
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn error_frame_becomes_remote_error() {
        let (host_side, mut worker) = tokio::io::duplex(64 * 1024);

        let fake = tokio::spawn(async move {
            let mut decoder = Decoder::new();
            accept(&mut worker, &mut decoder).await;
            let exec = next_frame(&mut worker, &mut decoder).await;
            let payload = worker_proto::encode_error("bad request");
            send(&mut worker, MSG_ERROR, exec.seq, &payload).await;
        });

        let mut channel = connect(host_side).await.unwrap();
        let err = channel.exec(&ExecutionRequest::new("r3", "x")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Remote(ref m) if m == "bad request"));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_reports_worker_exit() {
        let (host_side, mut worker) = tokio::io::duplex(64 * 1024);

        let fake = tokio::spawn(async move {
            let mut decoder = Decoder::new();
            accept(&mut worker, &mut decoder).await;
            let _exec = next_frame(&mut worker, &mut decoder).await;
            drop(worker);
        });

        let mut channel = connect(host_side).await.unwrap();
        let err = channel.exec(&ExecutionRequest::new("r4", "x")).await.unwrap_err();
        assert!(matches!(err, SandboxError::WorkerExited));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_times_out_without_ready() {
        let (host_side, _worker) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(host_side);
        let err = WorkerChannel::connect(reader, writer, Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn shutdown_is_acknowledged() {
        let (host_side, mut worker) = tokio::io::duplex(64 * 1024);

        let fake = tokio::spawn(async move {
            let mut decoder = Decoder::new();
            accept(&mut worker, &mut decoder).await;
            let ping = next_frame(&mut worker, &mut decoder).await;
            send(&mut worker, MSG_PONG, ping.seq, &[]).await;
            let shutdown = next_frame(&mut worker, &mut decoder).await;
            assert_eq!(shutdown.msg_type, MSG_SHUTDOWN);
            send(&mut worker, MSG_SHUTDOWN_ACK, shutdown.seq, &[]).await;
        });

        let mut channel = connect(host_side).await.unwrap();
        channel.ping(Duration::from_secs(1)).await.unwrap();
        assert!(channel.shutdown(Duration::from_secs(1)).await);
        fake.await.unwrap();
    }
}
