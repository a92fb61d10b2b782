// Copyright 2018-2025 the Deno authors. MIT license.

use std::io;
use std::io::Write;

use nexec_ffi::EventSink;
use parking_lot::Mutex;
use serde_json::Value;

use crate::framing::write_frame;

/// The outbound half of a session's channel. The session worker writes
/// responses through it and trampolines write events, possibly from threads
/// the native library created, so the writer sits behind a lock and every
/// framed message goes out atomically.
pub struct Connection {
  writer: Mutex<Box<dyn Write + Send>>,
}

impl Connection {
  pub fn new(writer: Box<dyn Write + Send>) -> Connection {
    Connection {
      writer: Mutex::new(writer),
    }
  }

  pub fn send(&self, message: &Value) -> io::Result<()> {
    let payload = serde_json::to_vec(message)
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut writer = self.writer.lock();
    write_frame(&mut *writer, &payload)
  }
}

impl EventSink for Connection {
  fn send_event(&self, event: &Value) -> io::Result<()> {
    self.send(event)
  }
}
