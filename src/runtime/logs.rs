//! Demultiplexing of the daemon's framed log stream.
//!
//! Each frame is an 8 byte header followed by its payload:
//!
//! ```text
//! [stream, 0, 0, 0, len_be_u32 ...] payload[len]
//! ```
//!
//! `stream` is 0 (stdin), 1 (stdout) or 2 (stderr).
//!
//! bollard already splits the stream into [`LogOutput`] chunks. Those are
//! turned back into frames with [`reframe`] so that runtimes handing over
//! decoded chunks and runtimes handing over the raw body share
//! [`demultiplex`], including its handling of truncated trailing frames.

use bollard::container::LogOutput;

const HEADER_LEN: usize = 8;

fn is_frame_header(header: &[u8]) -> bool {
    header.len() >= HEADER_LEN && header[0] <= 2 && header[1..4] == [0, 0, 0]
}

/// Concatenates the payloads of all frames in `data`.
///
/// A trailing frame whose declared length exceeds what is left is emitted
/// raw from its payload start. Data that does not begin with a frame header
/// (TTY containers) is returned untouched.
pub fn demultiplex(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    if !is_frame_header(data) {
        return String::from_utf8_lossy(data).into_owned();
    }

    let mut output = Vec::with_capacity(data.len());
    let mut rest = data;
    while rest.len() >= HEADER_LEN {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let payload = &rest[HEADER_LEN..];
        if len > payload.len() {
            output.extend_from_slice(payload);
            rest = &[];
            break;
        }
        output.extend_from_slice(&payload[..len]);
        rest = &payload[len..];
    }
    // Fewer bytes than a header left over
    output.extend_from_slice(rest);

    String::from_utf8_lossy(&output).into_owned()
}

/// Wire form of one decoded chunk. TTY output has no frame header.
pub fn reframe(output: LogOutput) -> Vec<u8> {
    match output {
        LogOutput::StdIn { message } => frame(0, &message),
        LogOutput::StdOut { message } => frame(1, &message),
        LogOutput::StdErr { message } => frame(2, &message),
        LogOutput::Console { message } => message.to_vec(),
    }
}

/// Encodes one frame.
pub fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(stream);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
