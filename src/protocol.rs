//! Print-job encoding: frames, font-size commands, and payload chunking.
//!
//! A print request becomes an ordered [`PrintJob`] of [`Frame`]s. Raw byte
//! jobs are a single fire-and-forget frame; formatted-text jobs are a
//! font-size command, the UTF-8 text (acknowledged), and a reset command.

/// Maximum bytes per BLE write. Large enough for throughput, small enough to
/// stay under common transport write-size ceilings without overwhelming the
/// peripheral's receive buffer.
pub const CHUNK_SIZE: usize = 150;

/// Separator between the optional size prefix and the text to print.
pub const SIZE_SEPARATOR: &str = "///";

/// Font size selected when the request carries no usable size prefix.
pub const DEFAULT_FONT_SIZE: usize = 2;

/// ESC/POS font-size command table, indexed by size selector.
///
/// Index 0 (no enlargement) is reserved for raw use; text parsing clamps to
/// `1..=5` and can never reach it.
pub const FONT_SIZE_COMMANDS: [[u8; 3]; 6] = [
    [0x1d, 0x21, 0x00], // 0: no enlargement
    [0x1b, 0x4d, 0x01], // 1: compressed ASCII font
    [0x1b, 0x4d, 0x00], // 2: standard ASCII font
    [0x1d, 0x21, 0x11], // 3: double height
    [0x1d, 0x21, 0x22], // 4
    [0x1d, 0x21, 0x33], // 5
];

/// ESC @, restores the printer's default font state.
pub const RESET_COMMAND: [u8; 2] = [0x1b, 0x40];

/// How a frame's chunks are delivered over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Wait for the transport's write confirmation.
    WithAck,
    /// Send without waiting for confirmation.
    FireAndForget,
}

/// One unit of a print job: a payload and how to deliver it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub mode: DeliveryMode,
}

/// An ordered sequence of frames, built once per print request and consumed
/// left-to-right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    pub frames: Vec<Frame>,
}

/// Encodes a raw byte buffer as a single fire-and-forget frame.
///
/// - `buffer`: bytes to send verbatim (ESC/POS or printer-specific data)
///
/// Returns a one-frame PrintJob; chunking happens at send time
pub fn encode_raw_bytes(buffer: Vec<u8>) -> PrintJob {
    PrintJob {
        frames: vec![Frame {
            payload: buffer,
            mode: DeliveryMode::FireAndForget,
        }],
    }
}

/// Encodes a formatted-text request as font command, text, reset.
///
/// - `request`: text to print, optionally prefixed `"<size>///"`
///
/// Returns three frames in order: font-size command (fire-and-forget), UTF-8
/// text (acknowledged), reset command (fire-and-forget). Only the text frame
/// waits for confirmation; it is the frame whose success the caller cares
/// about. The trailing reset leaves the printer's font state clean for
/// unrelated prints.
pub fn encode_formatted_text(request: &str) -> PrintJob {
    let (size, text) = parse_size_prefix(request);
    PrintJob {
        frames: vec![
            Frame {
                payload: FONT_SIZE_COMMANDS[size].to_vec(),
                mode: DeliveryMode::FireAndForget,
            },
            Frame {
                payload: text.as_bytes().to_vec(),
                mode: DeliveryMode::WithAck,
            },
            Frame {
                payload: RESET_COMMAND.to_vec(),
                mode: DeliveryMode::FireAndForget,
            },
        ],
    }
}

/// Parses an optional `"<size>///<text>"` prefix.
///
/// - `request`: raw request string
///
/// Returns `(size, text)`. With a separator and a numeric left part, the size
/// is clamped to `1..=5`; a malformed (non-numeric) prefix silently falls
/// back to size 2 with the right part as text. Without a separator the whole
/// input is the text at size 2.
pub fn parse_size_prefix(request: &str) -> (usize, &str) {
    match request.split_once(SIZE_SEPARATOR) {
        Some((prefix, text)) => {
            let size = prefix
                .trim()
                .parse::<i64>()
                .map(|n| n.clamp(1, 5) as usize)
                .unwrap_or(DEFAULT_FONT_SIZE);
            (size, text)
        }
        None => (DEFAULT_FONT_SIZE, request),
    }
}

/// Splits a payload into chunks of at most `chunk_size` bytes.
///
/// - `data`: input bytes
/// - `chunk_size`: maximum size of each chunk
///
/// Returns Vec of byte slices; empty input yields no chunks
pub fn chunk_payload(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return Vec::new();
    }
    if chunk_size == 0 {
        return vec![data];
    }
    data.chunks(chunk_size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_prefix_defaults_without_separator() {
        assert_eq!(parse_size_prefix("HELLO"), (2, "HELLO"));
    }

    #[test]
    fn size_prefix_parses_and_clamps() {
        assert_eq!(parse_size_prefix("3///HELLO"), (3, "HELLO"));
        assert_eq!(parse_size_prefix("9///HELLO"), (5, "HELLO"));
        assert_eq!(parse_size_prefix("0///HELLO"), (1, "HELLO"));
        assert_eq!(parse_size_prefix("-2///HELLO"), (1, "HELLO"));
    }

    #[test]
    fn malformed_size_prefix_falls_back_to_default() {
        assert_eq!(parse_size_prefix("big///HELLO"), (2, "HELLO"));
        assert_eq!(parse_size_prefix("///HELLO"), (2, "HELLO"));
    }

    #[test]
    fn formatted_text_produces_font_text_reset() {
        let job = encode_formatted_text("3///HELLO");
        assert_eq!(job.frames.len(), 3);
        assert_eq!(job.frames[0].payload, vec![0x1d, 0x21, 0x11]);
        assert_eq!(job.frames[0].mode, DeliveryMode::FireAndForget);
        assert_eq!(job.frames[1].payload, b"HELLO".to_vec());
        assert_eq!(job.frames[1].mode, DeliveryMode::WithAck);
        assert_eq!(job.frames[2].payload, vec![0x1b, 0x40]);
        assert_eq!(job.frames[2].mode, DeliveryMode::FireAndForget);
    }

    #[test]
    fn formatted_text_without_prefix_uses_standard_font() {
        let job = encode_formatted_text("HELLO");
        assert_eq!(job.frames[0].payload, FONT_SIZE_COMMANDS[2].to_vec());
        assert_eq!(job.frames[1].payload, b"HELLO".to_vec());
    }

    #[test]
    fn raw_bytes_is_single_fire_and_forget_frame() {
        let job = encode_raw_bytes(vec![1, 2, 3]);
        assert_eq!(job.frames.len(), 1);
        assert_eq!(job.frames[0].payload, vec![1, 2, 3]);
        assert_eq!(job.frames[0].mode, DeliveryMode::FireAndForget);
    }

    #[test]
    fn chunks_round_trip_and_respect_bounds() {
        let data: Vec<u8> = (0..=255u8).cycle().take(473).collect();
        let chunks = chunk_payload(&data, CHUNK_SIZE);
        assert_eq!(chunks.len(), data.len().div_ceil(CHUNK_SIZE));
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
        let rejoined: Vec<u8> = chunks.concat();
        assert_eq!(rejoined, data);
    }

    #[test]
    fn empty_payload_yields_no_chunks() {
        assert!(chunk_payload(&[], CHUNK_SIZE).is_empty());
    }
}
