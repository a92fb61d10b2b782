// Copyright 2018-2025 the Deno authors. MIT license.

use std::io::Read;
use std::sync::Arc;

use nexec_ffi::call_function;
use nexec_ffi::ArgDescriptor;
use nexec_ffi::CallError;
use nexec_ffi::CallbackArgSpec;
use nexec_ffi::CallbackError;
use nexec_ffi::CallbackRegistry;
use nexec_ffi::DlfcnError;
use nexec_ffi::LayoutError;
use nexec_ffi::LibraryRegistry;
use nexec_ffi::StructMemberDef;
use nexec_ffi::StructRegistry;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;

use crate::connection::Connection;
use crate::framing::read_frame;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
  #[error("Invalid request payload: {0}")]
  Payload(#[from] serde_json::Error),
  #[error("Unknown command: {0}")]
  UnknownCommand(String),
  #[error(transparent)]
  Layout(#[from] LayoutError),
  #[error(transparent)]
  Dlfcn(#[from] DlfcnError),
  #[error(transparent)]
  Callback(#[from] CallbackError),
  #[error(transparent)]
  Call(#[from] CallError),
}

#[derive(Deserialize)]
struct RequestEnvelope {
  command: String,
  #[serde(default)]
  request_id: Option<String>,
  #[serde(default)]
  payload: Value,
}

#[derive(Deserialize)]
struct RegisterStructPayload {
  struct_name: String,
  definition: Vec<StructMemberDef>,
}

#[derive(Deserialize)]
struct UnregisterStructPayload {
  struct_name: String,
}

#[derive(Deserialize)]
struct LoadLibraryPayload {
  path: String,
}

#[derive(Deserialize)]
struct UnloadLibraryPayload {
  library_id: String,
}

#[derive(Deserialize)]
struct RegisterCallbackPayload {
  return_type: String,
  args_type: Vec<CallbackArgSpec>,
}

#[derive(Deserialize)]
struct UnregisterCallbackPayload {
  callback_id: String,
}

#[derive(Deserialize)]
struct CallFunctionPayload {
  library_id: String,
  function_name: String,
  return_type: String,
  #[serde(default)]
  args: Vec<ArgDescriptor>,
}

/// Everything scoped to one accepted connection. Struct names, library
/// handles and callback ids registered here are invisible to every other
/// session; they are destroyed with the session, callbacks first, then
/// libraries, then struct layouts (field order is drop order).
pub struct Session {
  callbacks: CallbackRegistry,
  libraries: LibraryRegistry,
  structs: Arc<StructRegistry>,
  connection: Arc<Connection>,
}

impl Session {
  pub fn new(connection: Arc<Connection>) -> Session {
    let structs = Arc::new(StructRegistry::new());
    let callbacks =
      CallbackRegistry::new(structs.clone(), connection.clone());
    Session {
      callbacks,
      libraries: LibraryRegistry::new(),
      structs,
      connection,
    }
  }

  /// The synchronous request→response loop. Exits when the peer closes the
  /// channel or an I/O error makes it unusable; every other failure is
  /// reported as an error response and the session stays open.
  pub fn run(mut self, mut reader: Box<dyn Read + Send>) {
    loop {
      let frame = match read_frame(&mut *reader) {
        Ok(Some(frame)) => frame,
        Ok(None) => break,
        Err(e) => {
          log::debug!("session read failed: {e}");
          break;
        }
      };
      let response = self.handle_frame(&frame);
      if let Err(e) = self.connection.send(&response) {
        log::debug!("session write failed: {e}");
        break;
      }
    }
    log::debug!("session closed");
  }

  pub fn handle_frame(&mut self, frame: &[u8]) -> Value {
    let envelope: RequestEnvelope = match serde_json::from_slice(frame) {
      Ok(envelope) => envelope,
      Err(e) => {
        return json!({
          "request_id": Value::Null,
          "status": "error",
          "error_message": format!("Malformed request envelope: {e}"),
        });
      }
    };
    let request_id = match envelope.request_id {
      Some(id) => Value::from(id),
      None => Value::Null,
    };
    log::debug!("dispatching command '{}'", envelope.command);
    match self.dispatch(&envelope.command, envelope.payload) {
      Ok(Some(data)) => json!({
        "request_id": request_id,
        "status": "success",
        "data": data,
      }),
      Ok(None) => json!({
        "request_id": request_id,
        "status": "success",
      }),
      Err(e) => {
        log::debug!("command '{}' failed: {e}", envelope.command);
        json!({
          "request_id": request_id,
          "status": "error",
          "error_message": e.to_string(),
        })
      }
    }
  }

  fn dispatch(
    &mut self,
    command: &str,
    payload: Value,
  ) -> Result<Option<Value>, SessionError> {
    match command {
      "register_struct" => {
        let payload: RegisterStructPayload = serde_json::from_value(payload)?;
        self
          .structs
          .register(&payload.struct_name, &payload.definition)?;
        Ok(None)
      }
      "unregister_struct" => {
        let payload: UnregisterStructPayload =
          serde_json::from_value(payload)?;
        self.structs.unregister(&payload.struct_name)?;
        Ok(None)
      }
      "load_library" => {
        let payload: LoadLibraryPayload = serde_json::from_value(payload)?;
        let library_id = self.libraries.load(&payload.path)?;
        Ok(Some(json!({ "library_id": library_id })))
      }
      "unload_library" => {
        let payload: UnloadLibraryPayload = serde_json::from_value(payload)?;
        self.libraries.unload(&payload.library_id)?;
        Ok(None)
      }
      "register_callback" => {
        let payload: RegisterCallbackPayload =
          serde_json::from_value(payload)?;
        let callback_id = self
          .callbacks
          .register(&payload.return_type, &payload.args_type)?;
        Ok(Some(json!({ "callback_id": callback_id })))
      }
      "unregister_callback" => {
        let payload: UnregisterCallbackPayload =
          serde_json::from_value(payload)?;
        self.callbacks.unregister(&payload.callback_id)?;
        Ok(None)
      }
      "call_function" => {
        let payload: CallFunctionPayload = serde_json::from_value(payload)?;
        let func_ptr = self
          .libraries
          .symbol(&payload.library_id, &payload.function_name)?;
        log::debug!(
          "calling '{}' in {}",
          payload.function_name,
          payload.library_id
        );
        // SAFETY: declaring a signature that matches the native function is
        // the controller's contract.
        let outcome = unsafe {
          call_function(
            func_ptr,
            &payload.return_type,
            &payload.args,
            &self.structs,
            &self.callbacks,
          )
        }?;
        Ok(Some(serde_json::to_value(outcome)?))
      }
      _ => Err(SessionError::UnknownCommand(command.to_string())),
    }
  }
}
