// Copyright 2018-2025 the Deno authors. MIT license.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::size_of;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use base64::Engine;
use libffi::middle::Cif;
use libffi::middle::Closure;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;

use crate::ir;
use crate::layout::ElementType;
use crate::layout::StructLayout;
use crate::layout::StructRegistry;
use crate::symbol::NativeType;

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
  #[error("Unknown type: {0}")]
  UnknownType(String),
  #[error("Callback with ID {0} not found")]
  UnknownCallback(String),
  #[error("Type '{0}' is not allowed as a callback argument")]
  InvalidArgumentType(String),
  #[error("A 'buffer_ptr' argument requires 'size_arg_index' or 'fixed_size'")]
  MissingBufferSize,
  #[error("Invalid callback argument spec type '{0}'")]
  InvalidSpecType(String),
  #[error("'size_arg_index' {0} is out of range")]
  SizeArgOutOfRange(usize),
  #[error("'size_arg_index' {0} does not reference an integer argument")]
  SizeArgNotInteger(usize),
}

/// Destination for `invoke_callback` events. Implemented by the session's
/// outbound channel; trampolines may call it from any thread, so whole
/// messages must be serialised by the implementation.
pub trait EventSink: Send + Sync {
  fn send_event(&self, event: &Value) -> std::io::Result<()>;
}

/// One argument in a `register_callback` payload: either a plain type name
/// or a `buffer_ptr` object carrying its length source.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CallbackArgSpec {
  Name(String),
  BufferPtr(BufferPtrSpec),
}

#[derive(Debug, Deserialize)]
pub struct BufferPtrSpec {
  #[serde(rename = "type")]
  pub type_name: String,
  pub size_arg_index: Option<usize>,
  pub fixed_size: Option<usize>,
}

enum LenSource {
  SiblingArg(usize),
  Fixed(usize),
}

enum ArgKind {
  Scalar(NativeType),
  Aggregate(Arc<StructLayout>),
  BufferPtr(LenSource),
}

struct ResolvedArg {
  type_name: String,
  kind: ArgKind,
}

/// Per-callback context block handed to the closure entry routine. Leaked
/// at registration and reclaimed when the registration drops; native code
/// may enter the trampoline from any thread while it is alive.
struct CallbackInfo {
  callback_id: String,
  args: Vec<ResolvedArg>,
  result_zero_len: usize,
  sink: Arc<dyn EventSink>,
}

struct CallbackRegistration {
  // The closure must be freed before its context block.
  closure: ManuallyDrop<Closure<'static>>,
  info: *mut CallbackInfo,
  code: usize,
}

#[allow(clippy::non_send_fields_in_send_ty)]
// SAFETY: the closure and context block are heap allocations that are not
// tied to the registering thread.
unsafe impl Send for CallbackRegistration {}

impl Drop for CallbackRegistration {
  fn drop(&mut self) {
    // SAFETY: dropped exactly once; the closure goes first so no native
    // entry can race the context block while libffi unmaps it.
    unsafe {
      ManuallyDrop::drop(&mut self.closure);
      drop(Box::from_raw(self.info));
    }
  }
}

/// Per-session table of live callback trampolines, keyed by `cb-<uuid>`.
pub struct CallbackRegistry {
  structs: Arc<StructRegistry>,
  sink: Arc<dyn EventSink>,
  callbacks: Mutex<HashMap<String, CallbackRegistration>>,
}

impl CallbackRegistry {
  pub fn new(
    structs: Arc<StructRegistry>,
    sink: Arc<dyn EventSink>,
  ) -> CallbackRegistry {
    CallbackRegistry {
      structs,
      sink,
      callbacks: Mutex::new(HashMap::new()),
    }
  }

  /// Synthesises a live native function pointer for the given signature and
  /// returns its `cb-<uuid>` id. The pointer stays valid until
  /// [`CallbackRegistry::unregister`] or session teardown.
  pub fn register(
    &self,
    return_type: &str,
    arg_specs: &[CallbackArgSpec],
  ) -> Result<String, CallbackError> {
    let (result_type, result_zero_len) = self.resolve_return(return_type)?;

    let mut args = Vec::with_capacity(arg_specs.len());
    let mut arg_types = Vec::with_capacity(arg_specs.len());
    for spec in arg_specs {
      let resolved = self.resolve_arg(spec)?;
      arg_types.push(match &resolved.kind {
        ArgKind::Scalar(ty) => (*ty).into(),
        ArgKind::Aggregate(layout) => layout.ffi_type.clone(),
        ArgKind::BufferPtr(_) => libffi::middle::Type::pointer(),
      });
      args.push(resolved);
    }
    // A sibling length argument must exist and hold an integer.
    for resolved in &args {
      if let ArgKind::BufferPtr(LenSource::SiblingArg(index)) = &resolved.kind
      {
        match args.get(*index) {
          None => return Err(CallbackError::SizeArgOutOfRange(*index)),
          Some(sibling) => match &sibling.kind {
            ArgKind::Scalar(ty) if ty.is_integer() => {}
            _ => return Err(CallbackError::SizeArgNotInteger(*index)),
          },
        }
      }
    }

    let callback_id = format!("cb-{}", uuid::Uuid::new_v4());
    let info = Box::into_raw(Box::new(CallbackInfo {
      callback_id: callback_id.clone(),
      args,
      result_zero_len,
      sink: self.sink.clone(),
    }));

    let cif = Cif::new(arg_types, result_type);
    // SAFETY: info is leaked, non-null, and stays valid for as long as the
    // closure exists.
    let closure =
      Closure::new(cif, callback_trampoline, unsafe { &*info });
    let code = *closure.code_ptr() as usize;

    self.callbacks.lock().insert(
      callback_id.clone(),
      CallbackRegistration {
        closure: ManuallyDrop::new(closure),
        info,
        code,
      },
    );
    Ok(callback_id)
  }

  /// Frees the trampoline. Any subsequent native invocation through the
  /// stale pointer is undefined behaviour; the controller must ensure the
  /// native library released it first.
  pub fn unregister(&self, callback_id: &str) -> Result<(), CallbackError> {
    self
      .callbacks
      .lock()
      .remove(callback_id)
      .map(|_| ())
      .ok_or_else(|| CallbackError::UnknownCallback(callback_id.to_string()))
  }

  pub fn trampoline_address(
    &self,
    callback_id: &str,
  ) -> Result<usize, CallbackError> {
    self
      .callbacks
      .lock()
      .get(callback_id)
      .map(|registration| registration.code)
      .ok_or_else(|| CallbackError::UnknownCallback(callback_id.to_string()))
  }

  fn resolve_return(
    &self,
    name: &str,
  ) -> Result<(libffi::middle::Type, usize), CallbackError> {
    if let Some(ty) = NativeType::from_name(name) {
      if matches!(ty, NativeType::Buffer | NativeType::BufferPtr) {
        return Err(CallbackError::UnknownType(name.to_string()));
      }
      let size = ty.size();
      // libffi may store an integral closure result as a full word.
      let zero_len = if size == 0 { 0 } else { size.max(size_of::<usize>()) };
      return Ok((ty.into(), zero_len));
    }
    let layout = self
      .structs
      .resolve(name)
      .ok_or_else(|| CallbackError::UnknownType(name.to_string()))?;
    Ok((layout.ffi_type.clone(), layout.size))
  }

  fn resolve_arg(
    &self,
    spec: &CallbackArgSpec,
  ) -> Result<ResolvedArg, CallbackError> {
    match spec {
      CallbackArgSpec::Name(name) => {
        if let Some(ty) = NativeType::from_name(name) {
          let kind = match ty {
            NativeType::Void | NativeType::Buffer => {
              return Err(CallbackError::InvalidArgumentType(name.clone()));
            }
            // A bare "buffer_ptr" has no length source.
            NativeType::BufferPtr => {
              return Err(CallbackError::MissingBufferSize);
            }
            // A callback-typed argument serialises as its address.
            NativeType::Callback => ArgKind::Scalar(NativeType::Pointer),
            ty => ArgKind::Scalar(ty),
          };
          return Ok(ResolvedArg {
            type_name: name.clone(),
            kind,
          });
        }
        let layout = self
          .structs
          .resolve(name)
          .ok_or_else(|| CallbackError::UnknownType(name.clone()))?;
        Ok(ResolvedArg {
          type_name: name.clone(),
          kind: ArgKind::Aggregate(layout),
        })
      }
      CallbackArgSpec::BufferPtr(spec) => {
        if spec.type_name != "buffer_ptr" {
          return Err(CallbackError::InvalidSpecType(spec.type_name.clone()));
        }
        let len = match (spec.size_arg_index, spec.fixed_size) {
          (Some(index), _) => LenSource::SiblingArg(index),
          (None, Some(size)) => LenSource::Fixed(size),
          (None, None) => return Err(CallbackError::MissingBufferSize),
        };
        Ok(ResolvedArg {
          type_name: "buffer_ptr".to_string(),
          kind: ArgKind::BufferPtr(len),
        })
      }
    }
  }
}

/// Reads a sibling length argument at its declared width and widens it to
/// a signed 64-bit value.
unsafe fn read_len_arg(slot: *const c_void, ty: NativeType) -> i64 {
  match ty {
    NativeType::Int8 => *(slot as *const i8) as i64,
    NativeType::Uint8 => *(slot as *const u8) as i64,
    NativeType::Int16 => *(slot as *const i16) as i64,
    NativeType::Uint16 => *(slot as *const u16) as i64,
    NativeType::Int32 => *(slot as *const i32) as i64,
    NativeType::Uint32 => *(slot as *const u32) as i64,
    NativeType::Int64 => *(slot as *const i64),
    NativeType::Uint64 => *(slot as *const u64) as i64,
    _ => 0,
  }
}

/// The single entry routine behind every trampoline. Native code may call
/// it concurrently on any thread; it serialises the argument slots into an
/// `invoke_callback` event, emits it on the owning session's channel, and
/// zeroes the return slot so the native caller always observes a default
/// result.
unsafe extern "C" fn callback_trampoline(
  _cif: &libffi::low::ffi_cif,
  result: &mut c_void,
  args: *const *const c_void,
  info: &CallbackInfo,
) {
  let slots = std::slice::from_raw_parts(args, info.args.len());

  let mut event_args = Vec::with_capacity(info.args.len());
  for (index, arg) in info.args.iter().enumerate() {
    let entry = match &arg.kind {
      ArgKind::Scalar(ty) => {
        match ir::read(slots[index] as *const u8, &ElementType::Scalar(*ty)) {
          Ok(value) => json!({ "type": arg.type_name, "value": value }),
          Err(e) => {
            log::error!(
              "failed to serialize callback argument {index}: {e}"
            );
            json!({ "type": arg.type_name, "value": Value::Null })
          }
        }
      }
      // A by-value aggregate slot is the aggregate storage itself.
      ArgKind::Aggregate(layout) => {
        let ty = ElementType::Aggregate(layout.clone());
        match ir::read(slots[index] as *const u8, &ty) {
          Ok(value) => json!({ "type": arg.type_name, "value": value }),
          Err(e) => {
            log::error!(
              "failed to serialize callback argument {index}: {e}"
            );
            json!({ "type": arg.type_name, "value": Value::Null })
          }
        }
      }
      ArgKind::BufferPtr(len_source) => {
        let ptr = *(slots[index] as *const *const u8);
        let len = match len_source {
          LenSource::SiblingArg(sibling) => {
            match &info.args[*sibling].kind {
              ArgKind::Scalar(ty) => read_len_arg(slots[*sibling], *ty),
              _ => 0,
            }
          }
          LenSource::Fixed(len) => *len as i64,
        };
        if ptr.is_null() || len <= 0 {
          json!({ "type": "buffer_ptr", "value": "", "size": 0 })
        } else {
          let bytes = std::slice::from_raw_parts(ptr, len as usize);
          let encoded =
            base64::engine::general_purpose::STANDARD.encode(bytes);
          json!({ "type": "buffer_ptr", "value": encoded, "size": len })
        }
      }
    };
    event_args.push(entry);
  }

  let event = json!({
    "event": "invoke_callback",
    "payload": {
      "callback_id": info.callback_id,
      "args": event_args,
    },
  });
  if let Err(e) = info.sink.send_event(&event) {
    log::error!("failed to emit invoke_callback event: {e}");
  }

  if info.result_zero_len > 0 {
    std::ptr::write_bytes(
      result as *mut c_void as *mut u8,
      0,
      info.result_zero_len,
    );
  }
}
