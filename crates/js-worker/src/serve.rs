//! Worker side of the framed protocol.
//!
//! A worker owns one connection (its stdin/stdout when spawned by the host)
//! and handles one request at a time. Timeouts are the host's job: the host
//! kills the worker's process group instead of asking it to stop.

use std::io::{self, Read, Write};

use sandbox::{ErrorKind, ExecutionResult};
use tracing::{debug, info, warn};
use worker_proto::{
    MSG_ERROR, MSG_EXEC, MSG_EXEC_RESULT, MSG_PING, MSG_PONG, MSG_READY, MSG_SHUTDOWN,
    MSG_SHUTDOWN_ACK, ProtocolError, RawMessage,
};

use crate::evaluator::Evaluator;

/// Read buffer size for the serve loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

fn to_io_error(e: ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

enum Reply {
    Frame(Vec<u8>),
    FrameThenStop(Vec<u8>),
}

fn error_frame(seq: u32, message: &str) -> io::Result<Vec<u8>> {
    worker_proto::encode(MSG_ERROR, seq, &worker_proto::encode_error(message)).map_err(to_io_error)
}

/// Encode a result frame. A result too large or otherwise unencodable is
/// replaced by a serialization failure for the same id.
fn result_frame(seq: u32, result: &ExecutionResult) -> io::Result<Vec<u8>> {
    let encoded = worker_proto::encode_exec_result(result)
        .and_then(|payload| worker_proto::encode(MSG_EXEC_RESULT, seq, &payload));
    match encoded {
        Ok(frame) => Ok(frame),
        Err(e) => {
            warn!(request_id = %result.id, error = %e, "result could not be encoded");
            let fallback = ExecutionResult::failed(
                result.id.as_str(),
                ErrorKind::Serialization,
                format!("result could not be serialized: {e}"),
                result.duration_ms,
            );
            let payload = worker_proto::encode_exec_result(&fallback).map_err(to_io_error)?;
            worker_proto::encode(MSG_EXEC_RESULT, seq, &payload).map_err(to_io_error)
        }
    }
}

fn handle_message(msg: &RawMessage, evaluator: &Evaluator) -> io::Result<Reply> {
    match msg.msg_type {
        MSG_PING => Ok(Reply::Frame(
            worker_proto::encode(MSG_PONG, msg.seq, &[]).map_err(to_io_error)?,
        )),
        MSG_EXEC => {
            let request = match worker_proto::decode_exec(&msg.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(seq = msg.seq, error = %e, "malformed exec payload");
                    return Ok(Reply::Frame(error_frame(msg.seq, &e.to_string())?));
                }
            };
            debug!(
                request_id = %request.id,
                instrument = request.instrument,
                code_len = request.code.len(),
                "exec"
            );
            let result = evaluator.evaluate(&request);
            Ok(Reply::Frame(result_frame(msg.seq, &result)?))
        }
        MSG_SHUTDOWN => {
            info!("shutdown requested");
            Ok(Reply::FrameThenStop(
                worker_proto::encode(MSG_SHUTDOWN_ACK, msg.seq, &[]).map_err(to_io_error)?,
            ))
        }
        other => {
            warn!(msg_type = other, "unexpected message type");
            Ok(Reply::Frame(error_frame(
                msg.seq,
                &format!("unexpected message type 0x{other:02X}"),
            )?))
        }
    }
}

/// Serve one connection until EOF or shutdown.
///
/// Sends `ready` first, then answers each message in arrival order.
pub fn serve<R: Read, W: Write>(mut reader: R, mut writer: W, evaluator: &Evaluator) -> io::Result<()> {
    let mut decoder = worker_proto::Decoder::new();

    let ready = worker_proto::encode(MSG_READY, 0, &[]).map_err(to_io_error)?;
    writer.write_all(&ready)?;
    writer.flush()?;
    debug!("sent ready");

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        for msg in decoder
            .decode(buf.get(..n).unwrap_or_default())
            .map_err(to_io_error)?
        {
            match handle_message(&msg, evaluator)? {
                Reply::Frame(frame) => {
                    writer.write_all(&frame)?;
                    writer.flush()?;
                }
                Reply::FrameThenStop(frame) => {
                    writer.write_all(&frame)?;
                    writer.flush()?;
                    return Ok(());
                }
            }
        }
    }

    debug!("host disconnected");
    Ok(())
}
