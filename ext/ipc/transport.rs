// Copyright 2018-2025 the Deno authors. MIT license.

//! Platform transport for the service endpoint: a Unix domain socket at
//! `/tmp/<name>` on one OS family, a named pipe at `\\.\pipe\<name>` on the
//! other. Both sides speak the same length-prefixed framing on top.

use std::io;
use std::io::Read;
use std::io::Write;

/// The two halves of one accepted connection. The reader stays with the
/// session worker; the writer moves into the shared outbound channel.
pub struct ConnectionStream {
  pub reader: Box<dyn Read + Send>,
  pub writer: Box<dyn Write + Send>,
}

#[cfg(unix)]
pub use unix::Listener;

#[cfg(unix)]
mod unix {
  use super::ConnectionStream;
  use std::io;
  use std::os::unix::net::UnixListener;
  use std::os::unix::net::UnixStream;
  use std::path::PathBuf;
  use std::sync::atomic::AtomicBool;
  use std::sync::atomic::Ordering;

  pub struct Listener {
    path: PathBuf,
    inner: UnixListener,
    stopped: AtomicBool,
  }

  impl Listener {
    pub fn bind(name: &str) -> io::Result<Listener> {
      let path = PathBuf::from(format!("/tmp/{name}"));
      // A stale socket file from an earlier run would fail the bind.
      let _ = std::fs::remove_file(&path);
      let inner = UnixListener::bind(&path)?;
      Ok(Listener {
        path,
        inner,
        stopped: AtomicBool::new(false),
      })
    }

    pub fn endpoint(&self) -> String {
      self.path.display().to_string()
    }

    /// Blocks until a client connects. Returns `None` once the listener has
    /// been stopped.
    pub fn accept(&self) -> io::Result<Option<ConnectionStream>> {
      let (stream, _) = self.inner.accept()?;
      if self.stopped.load(Ordering::SeqCst) {
        return Ok(None);
      }
      let reader = stream.try_clone()?;
      Ok(Some(ConnectionStream {
        reader: Box::new(reader),
        writer: Box::new(stream),
      }))
    }

    /// Makes the blocking accept return. The throwaway self-connection is
    /// swallowed by the stopped check in `accept`.
    pub fn stop(&self) {
      self.stopped.store(true, Ordering::SeqCst);
      let _ = UnixStream::connect(&self.path);
    }
  }

  impl Drop for Listener {
    fn drop(&mut self) {
      let _ = std::fs::remove_file(&self.path);
    }
  }
}

#[cfg(windows)]
pub use windows::Listener;

#[cfg(windows)]
mod windows {
  use super::ConnectionStream;
  use std::ffi::CString;
  use std::fs::File;
  use std::io;
  use std::os::windows::io::FromRawHandle;
  use std::sync::atomic::AtomicBool;
  use std::sync::atomic::Ordering;
  use winapi::shared::winerror::ERROR_PIPE_CONNECTED;
  use winapi::um::errhandlingapi::GetLastError;
  use winapi::um::handleapi::CloseHandle;
  use winapi::um::handleapi::INVALID_HANDLE_VALUE;
  use winapi::um::namedpipeapi::ConnectNamedPipe;
  use winapi::um::winbase::CreateNamedPipeA;
  use winapi::um::winbase::PIPE_ACCESS_DUPLEX;
  use winapi::um::winbase::PIPE_READMODE_BYTE;
  use winapi::um::winbase::PIPE_TYPE_BYTE;
  use winapi::um::winbase::PIPE_UNLIMITED_INSTANCES;
  use winapi::um::winbase::PIPE_WAIT;

  pub struct Listener {
    pipe_name: String,
    stopped: AtomicBool,
  }

  impl Listener {
    pub fn bind(name: &str) -> io::Result<Listener> {
      Ok(Listener {
        pipe_name: format!(r"\\.\pipe\{name}"),
        stopped: AtomicBool::new(false),
      })
    }

    pub fn endpoint(&self) -> String {
      self.pipe_name.clone()
    }

    /// Creates the next pipe instance and blocks until a client connects.
    /// Returns `None` once the listener has been stopped.
    pub fn accept(&self) -> io::Result<Option<ConnectionStream>> {
      let name = CString::new(self.pipe_name.clone())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
      // SAFETY: winapi call; the name outlives the call.
      let handle = unsafe {
        CreateNamedPipeA(
          name.as_ptr(),
          PIPE_ACCESS_DUPLEX,
          PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
          PIPE_UNLIMITED_INSTANCES,
          4096,
          4096,
          0,
          std::ptr::null_mut(),
        )
      };
      if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
      }

      // SAFETY: handle is a live pipe instance created above.
      let connected = unsafe {
        ConnectNamedPipe(handle, std::ptr::null_mut()) != 0
          || GetLastError() == ERROR_PIPE_CONNECTED
      };
      if !connected {
        let error = io::Error::last_os_error();
        // SAFETY: handle is owned by this function until wrapped below.
        unsafe { CloseHandle(handle) };
        return Err(error);
      }
      if self.stopped.load(Ordering::SeqCst) {
        // SAFETY: see above.
        unsafe { CloseHandle(handle) };
        return Ok(None);
      }

      // SAFETY: ownership of the connected pipe handle moves to the File.
      let writer = unsafe { File::from_raw_handle(handle as _) };
      let reader = writer.try_clone()?;
      Ok(Some(ConnectionStream {
        reader: Box::new(reader),
        writer: Box::new(writer),
      }))
    }

    /// Makes the blocking `ConnectNamedPipe` return by connecting to the
    /// pipe ourselves.
    pub fn stop(&self) {
      self.stopped.store(true, Ordering::SeqCst);
      let _ = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&self.pipe_name);
    }
  }
}
