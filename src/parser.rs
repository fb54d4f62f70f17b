//! Decoder of the chunked reply protocol carried in response bodies.
//!
//! A body is a sequence of chunks, each made of the separator
//! `"\n\nPSG-Reply-Chunk: "`, a line of URL-encoded arguments, and, if the
//! arguments include a `size`, exactly that many bytes of binary payload.
//! Bytes may be fed in slices split at arbitrary positions.

use crate::args::Args;
use bytes::{Bytes, BytesMut};

const PREFIX: &[u8] = b"\n\nPSG-Reply-Chunk: ";

/// Upper bound of the space reserved up front for a payload. Larger payloads
/// grow the buffer as their bytes arrive.
const MAX_RESERVE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// Matching the separator; holds the number of bytes matched so far.
    Prefix(usize),
    /// Accumulating the argument line.
    Args,
    /// Accumulating the payload; holds the number of bytes still expected.
    Data(usize),
    /// The stream is corrupt. Everything else is ignored.
    Failed,
}

#[derive(Debug)]
pub(crate) struct Parser {
    state: State,
    line: Vec<u8>,
    args: Args,
    chunk: BytesMut,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            state: State::Prefix(0),
            line: Vec::new(),
            args: Args::default(),
            chunk: BytesMut::new(),
        }
    }
}

impl Parser {
    /// Feed a slice of the body, calling `on_chunk` for every chunk it
    /// completes.
    ///
    /// Returns a description of the problem if the body turns out to be
    /// malformed. The parser then ignores any further input.
    pub(crate) fn feed(
        &mut self,
        mut data: &[u8],
        mut on_chunk: impl FnMut(Args, Bytes),
    ) -> Result<(), String> {
        while !data.is_empty() {
            match self.state {
                State::Prefix(mut index) => {
                    while index < PREFIX.len() && data.first() == Some(&PREFIX[index]) {
                        data = &data[1..];
                        index += 1;
                    }

                    if index == PREFIX.len() {
                        self.state = State::Args;
                    } else if data.is_empty() {
                        self.state = State::Prefix(index);
                    } else {
                        self.state = State::Failed;

                        let remaining = data.len().min(PREFIX.len() - index);
                        let offending = String::from_utf8_lossy(&data[..remaining]);

                        return Err(if index > 0 {
                            format!("Prefix mismatch, offending part '{}'", offending)
                        } else {
                            offending.into_owned()
                        });
                    }
                }

                State::Args => match data.iter().position(|&b| b == b'\n') {
                    None => {
                        self.line.extend_from_slice(data);
                        data = &[];
                    }
                    Some(end) => {
                        self.line.extend_from_slice(&data[..end]);
                        data = &data[end + 1..];

                        let args = Args::parse(&self.line);
                        self.line.clear();

                        let size = match args.get("size") {
                            Some(size) if !size.is_empty() => match size.trim().parse() {
                                Ok(size) => size,
                                Err(_) => {
                                    self.state = State::Failed;
                                    return Err(format!(
                                        "Protocol error: invalid chunk size '{}'",
                                        size
                                    ));
                                }
                            },
                            _ => 0,
                        };

                        if size == 0 {
                            self.state = State::Prefix(0);
                            on_chunk(args, Bytes::new());
                        } else {
                            self.state = State::Data(size);
                            self.args = args;
                            self.chunk.reserve(size.min(MAX_RESERVE));
                        }
                    }
                },

                State::Data(remaining) => {
                    let take = remaining.min(data.len());
                    self.chunk.extend_from_slice(&data[..take]);
                    data = &data[take..];

                    if take == remaining {
                        self.state = State::Prefix(0);
                        on_chunk(std::mem::take(&mut self.args), self.chunk.split().freeze());
                    } else {
                        self.state = State::Data(remaining - take);
                    }
                }

                State::Failed => return Ok(()),
            }
        }

        Ok(())
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.state == State::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn body() -> Vec<u8> {
        let mut body = Vec::new();

        body.extend_from_slice(b"\n\nPSG-Reply-Chunk: item_id=1&item_type=blob_prop&chunk_type=meta&n_chunks=1\n");
        body.extend_from_slice(b"\n\nPSG-Reply-Chunk: item_id=1&item_type=blob&chunk_type=data&size=6\n");
        body.extend_from_slice(b"\x00\n\nPS\xff");
        body.extend_from_slice(b"\n\nPSG-Reply-Chunk: item_type=reply&chunk_type=meta&n_chunks=3\n");
        body
    }

    fn parse_in_slices(body: &[u8], slice: usize) -> Vec<(String, Bytes)> {
        let mut parser = Parser::default();
        let mut chunks = Vec::new();

        for part in body.chunks(slice) {
            parser
                .feed(part, |args, data| chunks.push((args.to_string(), data)))
                .unwrap();
        }

        chunks
    }

    #[test]
    fn any_slicing_yields_the_same_chunks() {
        let body = body();
        let whole = parse_in_slices(&body, body.len());

        assert_eq!(whole.len(), 3);
        assert_eq!(whole[1].1.as_ref(), b"\x00\n\nPS\xff");

        for slice in 1..body.len() {
            assert_eq!(parse_in_slices(&body, slice), whole, "slice size {}", slice);
        }
    }

    #[test]
    fn zero_size_dispatches_immediately() {
        let mut parser = Parser::default();
        let mut chunks = Vec::new();

        parser
            .feed(b"\n\nPSG-Reply-Chunk: chunk_type=data&size=0\n", |args, data| {
                chunks.push((args, data))
            })
            .unwrap();

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].1.is_empty());
    }

    #[test]
    fn arguments_are_percent_decoded() {
        let mut parser = Parser::default();
        let mut messages = Vec::new();

        parser
            .feed(b"\n\nPSG-Reply-Chunk: chunk_type=message&severity=error%20x\n", |args, _| {
                messages.push(args.get("severity").map(String::from))
            })
            .unwrap();

        assert_eq!(messages, [Some("error x".to_owned())]);
    }

    #[test_case(b"<html>", "<html>" ; "garbage at start")]
    #[test_case(b"\n\nPSG-Reply-Chunk x", "Prefix mismatch, offending part ' x'" ; "mismatch inside prefix")]
    #[test_case(b"\n\nPSG-Reply-Chunk: size=x\n", "Protocol error: invalid chunk size 'x'" ; "invalid size")]
    fn malformed_body(body: &[u8], expected: &str) {
        let mut parser = Parser::default();

        assert_eq!(parser.feed(body, |_, _| {}).unwrap_err(), expected);
        assert!(parser.is_failed());

        let mut called = false;
        parser.feed(&self::body(), |_, _| called = true).unwrap();
        assert!(!called);
    }

    #[test_case("18446744073709551615" ; "max usize")]
    #[test_case("100000000000" ; "hundred gigabytes")]
    fn huge_size_is_not_reserved(size: &str) {
        let mut parser = Parser::default();
        let header = format!("\n\nPSG-Reply-Chunk: chunk_type=data&size={}\n", size);
        let mut called = false;

        parser.feed(header.as_bytes(), |_, _| called = true).unwrap();
        parser.feed(b"partial payload", |_, _| called = true).unwrap();

        assert!(!called);
        assert!(parser.chunk.capacity() < 2 * MAX_RESERVE);
        assert!(!parser.is_failed());
    }

    #[test]
    fn mismatch_reports_at_most_rest_of_prefix() {
        let mut parser = Parser::default();
        let error = parser.feed(b"\n\nPSG-Reply-Chunk:Xabcdefghijklmnopqrstuvwxyz", |_, _| {});

        assert_eq!(error.unwrap_err(), "Prefix mismatch, offending part 'X'");
    }
}
