// Copyright 2018-2025 the Deno authors. MIT license.

use std::io;
use std::io::Read;
use std::io::Write;

/// Reads one length-prefixed message: a 4-byte big-endian payload length
/// followed by that many bytes. Returns `None` on a clean EOF before the
/// first length byte; an EOF anywhere later is an error.
pub fn read_frame(reader: &mut dyn Read) -> io::Result<Option<Vec<u8>>> {
  let mut len_buf = [0u8; 4];
  let mut filled = 0;
  while filled < len_buf.len() {
    let n = reader.read(&mut len_buf[filled..])?;
    if n == 0 {
      if filled == 0 {
        return Ok(None);
      }
      return Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed mid frame length",
      ));
    }
    filled += n;
  }

  let len = u32::from_be_bytes(len_buf) as usize;
  let mut payload = vec![0u8; len];
  reader.read_exact(&mut payload)?;
  Ok(Some(payload))
}

/// Writes one length-prefixed message and flushes it.
pub fn write_frame(writer: &mut dyn Write, payload: &[u8]) -> io::Result<()> {
  let len = u32::try_from(payload.len()).map_err(|_| {
    io::Error::new(io::ErrorKind::InvalidInput, "frame payload too large")
  })?;
  writer.write_all(&len.to_be_bytes())?;
  writer.write_all(payload)?;
  writer.flush()
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use std::io::Cursor;

  #[test]
  fn round_trip() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"{\"a\":1}").unwrap();
    write_frame(&mut buf, b"").unwrap();
    write_frame(&mut buf, b"second").unwrap();

    let mut cursor = Cursor::new(buf);
    assert_eq!(
      read_frame(&mut cursor).unwrap(),
      Some(b"{\"a\":1}".to_vec())
    );
    assert_eq!(read_frame(&mut cursor).unwrap(), Some(Vec::new()));
    assert_eq!(read_frame(&mut cursor).unwrap(), Some(b"second".to_vec()));
    assert_eq!(read_frame(&mut cursor).unwrap(), None);
  }

  #[test]
  fn length_prefix_is_big_endian() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"abcd").unwrap();
    assert_eq!(&buf[..4], &[0, 0, 0, 4]);
  }

  #[test]
  fn eof_mid_length_is_an_error() {
    let mut cursor = Cursor::new(vec![0u8, 0]);
    let err = read_frame(&mut cursor).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
  }

  #[test]
  fn eof_mid_payload_is_an_error() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"full payload").unwrap();
    buf.truncate(buf.len() - 3);
    let mut cursor = Cursor::new(buf);
    let err = read_frame(&mut cursor).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
  }
}
