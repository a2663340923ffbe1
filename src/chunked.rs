//! Chunked transfer coding, decoded from a push-fed buffer.
//!
//! See https://tools.ietf.org/html/rfc7230#section-4.1

use std::fmt::Display;
use std::io::{self, Write};

use http_types::Trailers;

use crate::{MAX_HEADERS, MAX_HEAD_LENGTH};

const MAX_CHUNK_SIZE: u64 = 0x0FFF_FFFF_FFFF_FFFF;

/// The last chunk and an empty trailer section.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkSizeState {
    ChunkSize,
    Extension,
    NewLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    BeforeChunk { size: u64, inner: ChunkSizeState },
    Data(u64),
    AfterChunk { new_line: bool },
    MaybeTrailer { new_line: bool },
    Trailer,
    Done,
}

/// Decodes a chunked body one buffered slice at a time.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: State,
    trailers: Option<Trailers>,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: State::BeforeChunk {
                size: 0,
                inner: ChunkSizeState::ChunkSize,
            },
            trailers: None,
        }
    }

    /// Whether the last chunk and the trailer section have been read.
    pub(crate) fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// The trailer fields that followed the last chunk, if there were any.
    pub(crate) fn take_trailers(&mut self) -> Option<Trailers> {
        self.trailers.take()
    }

    /// Decode as much of `buf` as possible, appending chunk data to `body`.
    ///
    /// Returns how many bytes of `buf` were consumed. Bytes past the end of
    /// the body are never consumed.
    pub(crate) fn decode(&mut self, buf: &[u8], body: &mut Vec<u8>) -> io::Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            let rest = &buf[offset..];
            match &mut self.state {
                State::BeforeChunk { size, inner } => {
                    let (amt, done) = read_chunk_size(rest, size, inner)?;
                    offset += amt;
                    if done {
                        self.state = match *size {
                            0 => State::MaybeTrailer { new_line: false },
                            size => State::Data(size),
                        };
                    }
                }
                State::Data(remaining) => {
                    let amt = (*remaining).min(rest.len() as u64) as usize;
                    body.extend_from_slice(&rest[..amt]);
                    offset += amt;
                    *remaining -= amt as u64;
                    if *remaining == 0 {
                        self.state = State::AfterChunk { new_line: false };
                    }
                }
                State::AfterChunk { new_line } => {
                    match (*new_line, rest[0]) {
                        (false, b'\r') => *new_line = true,
                        (true, b'\n') => {
                            self.state = State::BeforeChunk {
                                size: 0,
                                inner: ChunkSizeState::ChunkSize,
                            }
                        }
                        _ => return Err(invalid_data_err()),
                    }
                    offset += 1;
                }
                State::MaybeTrailer { new_line } => match (*new_line, rest[0]) {
                    (false, b'\r') => {
                        *new_line = true;
                        offset += 1;
                    }
                    (true, b'\n') => {
                        self.state = State::Done;
                        offset += 1;
                    }
                    (false, _) => self.state = State::Trailer,
                    (true, _) => return Err(invalid_data_err()),
                },
                State::Trailer => {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    match httparse::parse_headers(rest, &mut headers) {
                        Ok(httparse::Status::Complete((amt, headers))) => {
                            let mut trailers = Trailers::new();
                            for header in headers {
                                trailers.append(
                                    header.name,
                                    String::from_utf8_lossy(header.value).as_ref(),
                                );
                            }
                            log::trace!("{} trailer fields", headers.len());
                            self.trailers = Some(trailers);
                            self.state = State::Done;
                            offset += amt;
                        }
                        Ok(httparse::Status::Partial) if rest.len() >= MAX_HEAD_LENGTH => {
                            return Err(other_err("trailer section is too long"));
                        }
                        Ok(httparse::Status::Partial) => return Ok(offset),
                        Err(err) => return Err(other_err(err)),
                    }
                }
                State::Done => break,
            }
        }
        Ok(offset)
    }
}

fn read_chunk_size(
    buf: &[u8],
    size: &mut u64,
    state: &mut ChunkSizeState,
) -> io::Result<(usize, bool)> {
    for (offset, c) in buf.iter().copied().enumerate() {
        match *state {
            ChunkSizeState::ChunkSize => match c {
                b'0'..=b'9' => *size = (*size << 4) + (c - b'0') as u64,
                b'a'..=b'f' => *size = (*size << 4) + (c + 10 - b'a') as u64,
                b'A'..=b'F' => *size = (*size << 4) + (c + 10 - b'A') as u64,
                b';' => *state = ChunkSizeState::Extension,
                b'\r' => *state = ChunkSizeState::NewLine,
                _ => return Err(other_err(httparse::InvalidChunkSize)),
            },
            ChunkSizeState::Extension => {
                if c == b'\r' {
                    *state = ChunkSizeState::NewLine;
                }
            }
            ChunkSizeState::NewLine => match c {
                b'\n' => return Ok((offset + 1, true)),
                _ => return Err(other_err(httparse::InvalidChunkSize)),
            },
        }
        if *size > MAX_CHUNK_SIZE {
            return Err(other_err(httparse::InvalidChunkSize));
        }
    }
    Ok((buf.len(), false))
}

/// Frame `data` as one chunk. Empty input frames nothing; use `LAST_CHUNK`
/// to end the body.
pub(crate) fn encode_chunk(data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    write!(out, "{:X}\r\n", data.len())?;
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    Ok(())
}

fn other_err<E: Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

fn invalid_data_err() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "invalid chunked data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(input: &[u8]) -> (Vec<u8>, usize, ChunkedDecoder) {
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        let consumed = decoder.decode(input, &mut body).unwrap();
        (body, consumed, decoder)
    }

    #[test]
    fn test_chunked_wiki() {
        let input = "4\r\n\
                     Wiki\r\n\
                     5\r\n\
                     pedia\r\n\
                     E\r\n in\r\n\
                     \r\n\
                     chunks.\r\n\
                     0\r\n\
                     \r\n";
        let (body, consumed, decoder) = decode_all(input.as_bytes());
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "Wikipedia in\r\n\
             \r\n\
             chunks."
        );
        assert_eq!(consumed, input.len());
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunked_big() {
        let mut input: Vec<u8> = b"800\r\n".to_vec();
        input.extend(vec![b'X'; 2048]);
        input.extend(b"\r\n1800\r\n");
        input.extend(vec![b'Y'; 6144]);
        input.extend(b"\r\n0\r\n\r\n");

        let (body, _, decoder) = decode_all(&input);
        let mut expected = vec![b'X'; 2048];
        expected.extend(vec![b'Y'; 6144]);
        assert_eq!(body.len(), 8192);
        assert_eq!(body, expected);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunked_mdn_trailers() {
        let input = "7\r\n\
                     Mozilla\r\n\
                     9\r\n\
                     Developer\r\n\
                     0\r\n\
                     Expires: Wed, 21 Oct 2015 07:28:00 GMT\r\n\
                     \r\n";
        let (body, _, mut decoder) = decode_all(input.as_bytes());
        assert_eq!(body, b"MozillaDeveloper");
        let trailers = decoder.take_trailers().unwrap();
        assert_eq!(trailers.iter().count(), 1);
        assert_eq!(trailers["expires"], "Wed, 21 Oct 2015 07:28:00 GMT");
    }

    #[test]
    fn split_at_every_byte() {
        let input = b"3;name=value\r\nabc\r\n0\r\n\r\nnext";
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        let mut pending = Vec::new();
        for byte in input.iter() {
            pending.push(*byte);
            let consumed = decoder.decode(&pending, &mut body).unwrap();
            pending.drain(..consumed);
        }
        assert_eq!(body, b"abc");
        assert!(decoder.is_done());
        assert_eq!(pending, b"next");
    }

    #[test]
    fn bad_chunk_size_is_an_error() {
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.decode(b"zz\r\n", &mut Vec::new()).is_err());
    }

    #[test]
    fn chunk_framing() {
        let mut out = Vec::new();
        encode_chunk(b"hello world!", &mut out).unwrap();
        encode_chunk(b"", &mut out).unwrap();
        out.extend_from_slice(LAST_CHUNK);
        assert_eq!(out, b"C\r\nhello world!\r\n0\r\n\r\n".to_vec());
    }
}
