//! Request processing shared by both runtimes.
//!
//! Decodes every complete frame buffered on a connection, dispatches it, and
//! frames the reply into the write buffer. Both runtimes call this after
//! every socket read, so frames split or coalesced by TCP are handled the
//! same way.

use crate::protocol::{encode_response, try_decode_command, DecodeError};
use crate::runtime::ElasticBuffer;
use crate::storage::{Command, Reply};

/// Drain all complete frames from `input`, writing one response per frame to
/// `output`.
///
/// `execute` is called once per frame, in arrival order. Returns the number
/// of frames processed. On a protocol violation the offending frame is left
/// in `input`, responses to earlier frames stay in `output`, and the caller
/// must close the connection.
pub fn drain_requests<F>(
    input: &mut ElasticBuffer,
    output: &mut ElasticBuffer,
    mut execute: F,
) -> Result<usize, DecodeError>
where
    F: FnMut(Command) -> Reply,
{
    let mut processed = 0;
    while let Some(fields) = try_decode_command(input)? {
        let reply = execute(Command::from_fields(fields));
        encode_response(output, reply.status, &reply.payload);
        processed += 1;
    }
    Ok(processed)
}
