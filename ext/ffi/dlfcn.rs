// Copyright 2018-2025 the Deno authors. MIT license.

use std::collections::HashMap;
use std::ffi::c_void;

use dlopen2::raw::Library;

#[derive(Debug, thiserror::Error)]
pub enum DlfcnError {
  #[error("Failed to load library '{path}': {message}")]
  LoadingLibrary { path: String, message: String },
  #[error("Library not found: {0}")]
  UnknownLibrary(String),
  #[error("Failed to resolve symbol '{symbol}': {error}")]
  SymbolNotFound {
    symbol: String,
    #[source]
    error: dlopen2::Error,
  },
}

/// Per-session registry of opened shared libraries, keyed by `lib-<uuid>`.
/// Handles close when unloaded or when the session tears down.
#[derive(Default)]
pub struct LibraryRegistry {
  libraries: HashMap<String, Library>,
}

impl LibraryRegistry {
  pub fn new() -> LibraryRegistry {
    LibraryRegistry::default()
  }

  pub fn load(&mut self, path: &str) -> Result<String, DlfcnError> {
    let library =
      Library::open(path).map_err(|e| DlfcnError::LoadingLibrary {
        path: path.to_string(),
        message: format_error(e, path),
      })?;
    let library_id = format!("lib-{}", uuid::Uuid::new_v4());
    log::debug!("loaded library {path} as {library_id}");
    self.libraries.insert(library_id.clone(), library);
    Ok(library_id)
  }

  pub fn unload(&mut self, library_id: &str) -> Result<(), DlfcnError> {
    self
      .libraries
      .remove(library_id)
      .map(|_| ())
      .ok_or_else(|| DlfcnError::UnknownLibrary(library_id.to_string()))
  }

  pub fn symbol(
    &self,
    library_id: &str,
    name: &str,
  ) -> Result<*const c_void, DlfcnError> {
    let library = self
      .libraries
      .get(library_id)
      .ok_or_else(|| DlfcnError::UnknownLibrary(library_id.to_string()))?;
    // By default the loader error does not say which symbol was missing, so
    // wrap it with the name.
    // SAFETY: The obtained T symbol is the size of a pointer.
    unsafe { library.symbol::<*const c_void>(name) }.map_err(|error| {
      DlfcnError::SymbolNotFound {
        symbol: name.to_string(),
        error,
      }
    })
  }
}

// `path` is only used on Windows.
#[allow(unused_variables)]
pub(crate) fn format_error(e: dlopen2::Error, path: &str) -> String {
  match e {
    #[cfg(target_os = "windows")]
    // This calls FormatMessageW with the library path as replacement for
    // the insert sequences, unlike libstd which passes the
    // FORMAT_MESSAGE_IGNORE_INSERTS flag without any arguments.
    dlopen2::Error::OpeningLibraryError(e) => {
      use std::ffi::OsStr;
      use std::os::windows::ffi::OsStrExt;
      use winapi::shared::minwindef::DWORD;
      use winapi::shared::winerror::ERROR_INSUFFICIENT_BUFFER;
      use winapi::um::errhandlingapi::GetLastError;
      use winapi::um::winbase::FormatMessageW;
      use winapi::um::winbase::FORMAT_MESSAGE_ARGUMENT_ARRAY;
      use winapi::um::winbase::FORMAT_MESSAGE_FROM_SYSTEM;
      use winapi::um::winnt::LANG_SYSTEM_DEFAULT;
      use winapi::um::winnt::MAKELANGID;
      use winapi::um::winnt::SUBLANG_SYS_DEFAULT;

      let err_num = match e.raw_os_error() {
        Some(err_num) => err_num,
        // This should never hit unless dlopen changes its error type.
        None => return e.to_string(),
      };

      // Language ID (0x0800)
      let lang_id =
        MAKELANGID(LANG_SYSTEM_DEFAULT, SUBLANG_SYS_DEFAULT) as DWORD;

      let mut buf = vec![0; 500];

      let path = OsStr::new(path)
        .encode_wide()
        .chain(Some(0))
        .collect::<Vec<_>>();

      let arguments = [path.as_ptr()];

      loop {
        // SAFETY:
        // winapi call to format the error message
        let length = unsafe {
          FormatMessageW(
            FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_ARGUMENT_ARRAY,
            std::ptr::null_mut(),
            err_num as DWORD,
            lang_id as DWORD,
            buf.as_mut_ptr(),
            buf.len() as DWORD,
            arguments.as_ptr() as _,
          )
        };

        if length == 0 {
          // SAFETY:
          // winapi call to get the last error message
          let err_num = unsafe { GetLastError() };
          if err_num == ERROR_INSUFFICIENT_BUFFER {
            buf.resize(buf.len() * 2, 0);
            continue;
          }

          // Something went wrong, just return the original error.
          return e.to_string();
        }

        let msg = String::from_utf16_lossy(&buf[..length as usize]);
        return msg;
      }
    }
    _ => e.to_string(),
  }
}
