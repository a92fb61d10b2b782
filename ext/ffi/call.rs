// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::c_void;
use std::mem::align_of;
use std::mem::size_of;

use base64::Engine;
use libffi::middle::Arg;
use libffi::middle::Cif;
use libffi::middle::CodePtr;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::arena::ArenaError;
use crate::arena::ArgArena;
use crate::callback::CallbackError;
use crate::callback::CallbackRegistry;
use crate::ir;
use crate::ir::MarshalError;
use crate::layout::ElementType;
use crate::layout::LayoutError;
use crate::layout::StructRegistry;
use crate::symbol::NativeType;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
  #[error("Unknown type: {0}")]
  UnknownType(String),
  #[error("Type '{0}' is not allowed as an argument")]
  InvalidArgumentType(String),
  #[error("Type '{0}' is not allowed as a return type")]
  UnsupportedReturnType(String),
  #[error("Direction '{direction}' is not supported for type '{type_name}'")]
  InvalidDirection {
    direction: &'static str,
    type_name: String,
  },
  #[error("Argument {index} is missing required field '{field}'")]
  MissingField { index: usize, field: &'static str },
  #[error("Buffer size may not be negative, got {0}")]
  NegativeBufferSize(i64),
  #[error("Buffer value of {length} bytes exceeds declared size {capacity}")]
  BufferTooLong { length: usize, capacity: usize },
  #[error("Argument {0}: buffer value must be a base64 string")]
  InvalidBufferValue(usize),
  #[error("Argument {0}: callback value must be a callback id")]
  ExpectedCallbackId(usize),
  #[error("Expected an array value for target type '{0}'")]
  ExpectedArray(String),
  #[error("Array of '{0}' is too large")]
  ArrayTooLarge(String),
  #[error(transparent)]
  Base64(#[from] base64::DecodeError),
  #[error(transparent)]
  Layout(#[from] LayoutError),
  #[error(transparent)]
  Marshal(#[from] MarshalError),
  #[error(transparent)]
  Arena(#[from] ArenaError),
  #[error(transparent)]
  Callback(#[from] CallbackError),
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  #[default]
  In,
  Out,
  Inout,
}

impl Direction {
  fn name(self) -> &'static str {
    match self {
      Direction::In => "in",
      Direction::Out => "out",
      Direction::Inout => "inout",
    }
  }
}

/// One actual argument as it appears in a `call_function` payload.
#[derive(Debug, Deserialize)]
pub struct ArgDescriptor {
  #[serde(rename = "type")]
  pub type_name: String,
  #[serde(default)]
  pub value: Value,
  #[serde(default)]
  pub direction: Direction,
  #[serde(default)]
  pub size: Option<i64>,
  #[serde(default)]
  pub target_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReturnValue {
  #[serde(rename = "type")]
  pub type_name: String,
  pub value: Value,
}

#[derive(Debug, Serialize)]
pub struct OutParam {
  pub index: usize,
  #[serde(rename = "type")]
  pub type_name: String,
  pub value: Value,
}

#[derive(Debug, Serialize)]
pub struct CallOutcome {
  #[serde(rename = "return")]
  pub return_value: ReturnValue,
  pub out_params: Vec<OutParam>,
}

enum OutParamKind {
  Buffer { capacity: usize },
  Target(ElementType),
}

/// An argument slot whose storage the callee may have written; read back
/// after the call completes.
struct OutParamRecord {
  index: usize,
  kind: OutParamKind,
  storage: *mut u8,
}

fn argument_ffi_type(
  type_name: &str,
  structs: &StructRegistry,
) -> Result<libffi::middle::Type, CallError> {
  if let Some(ty) = NativeType::from_name(type_name) {
    return match ty {
      NativeType::Void | NativeType::BufferPtr => {
        Err(CallError::InvalidArgumentType(type_name.to_string()))
      }
      ty => Ok(ty.into()),
    };
  }
  structs
    .resolve(type_name)
    .map(|layout| layout.ffi_type.clone())
    .ok_or_else(|| CallError::UnknownType(type_name.to_string()))
}

fn return_element(
  type_name: &str,
  structs: &StructRegistry,
) -> Result<Option<ElementType>, CallError> {
  if let Some(ty) = NativeType::from_name(type_name) {
    return match ty {
      NativeType::Void => Ok(None),
      NativeType::Callback | NativeType::Buffer | NativeType::BufferPtr => {
        Err(CallError::UnsupportedReturnType(type_name.to_string()))
      }
      ty => Ok(Some(ElementType::Scalar(ty))),
    };
  }
  structs
    .resolve(type_name)
    .map(|layout| Some(ElementType::Aggregate(layout)))
    .ok_or_else(|| CallError::UnknownType(type_name.to_string()))
}

/// Invokes `func_ptr` with arguments marshalled from `args`, returning the
/// marshalled return value plus the post-call contents of every `out` and
/// `inout` argument. Any marshalling or type failure aborts the call before
/// the native function is entered.
///
/// A `string` return value is read to its NUL terminator with no length
/// bound; the callee must hand back a valid C string.
///
/// # Safety
///
/// `func_ptr` must point to a function whose actual signature matches the
/// declared return type and argument descriptors.
pub unsafe fn call_function(
  func_ptr: *const c_void,
  return_type: &str,
  args: &[ArgDescriptor],
  structs: &StructRegistry,
  callbacks: &CallbackRegistry,
) -> Result<CallOutcome, CallError> {
  let return_ty = return_element(return_type, structs)?;

  let mut arena = ArgArena::new();
  let mut arg_types = Vec::with_capacity(args.len());
  let mut arg_values: Vec<Arg> = Vec::with_capacity(args.len());
  let mut records: Vec<OutParamRecord> = Vec::new();

  for (index, descriptor) in args.iter().enumerate() {
    arg_types.push(argument_ffi_type(&descriptor.type_name, structs)?);
    let slot = prepare_argument(
      index,
      descriptor,
      structs,
      callbacks,
      &mut arena,
      &mut records,
    )?;
    // SAFETY: slot is a live arena allocation; the Arg only captures its
    // address.
    arg_values.push(Arg::new(&*slot));
  }

  let (return_ffi, return_slot) = match &return_ty {
    None => (libffi::middle::Type::void(), std::ptr::null_mut()),
    Some(ty) => {
      // The slot is over-allocated by one machine word:
      // https://github.com/libffi/libffi/issues/946
      let slot = arena.aggregate(
        ty.size() + size_of::<usize>(),
        ty.alignment().max(align_of::<usize>()),
      )?;
      (ty.ffi_type(), slot)
    }
  };

  let cif = Cif::new(arg_types, return_ffi);
  let fun_ptr = CodePtr::from_ptr(func_ptr);
  // SAFETY: the cif was prepared from the same descriptors the argument
  // storage was populated for; the return slot is large enough for the
  // declared return type.
  libffi::raw::ffi_call(
    cif.as_raw_ptr(),
    Some(*fun_ptr.as_safe_fun()),
    return_slot as *mut c_void,
    arg_values.as_ptr() as *mut *mut c_void,
  );

  let return_value = match &return_ty {
    None => Value::Null,
    // SAFETY: the callee wrote a value of the declared return type into
    // the slot. Strings nested in a returned aggregate are copied into the
    // JSON tree here, before the arena goes away.
    Some(ty) => ir::read(return_slot, ty)?,
  };

  let mut out_params = Vec::with_capacity(records.len());
  for record in records {
    match record.kind {
      OutParamKind::Buffer { capacity } => {
        // The entire declared capacity is reported, not just the prefix
        // the callee claims to have written.
        // SAFETY: storage is an arena allocation of `capacity` bytes
        // (plus slack).
        let bytes = std::slice::from_raw_parts(record.storage, capacity);
        out_params.push(OutParam {
          index: record.index,
          type_name: "buffer".to_string(),
          value: Value::from(
            base64::engine::general_purpose::STANDARD.encode(bytes),
          ),
        });
      }
      OutParamKind::Target(ty) => {
        // SAFETY: storage was allocated and populated for `ty`.
        let value = ir::read(record.storage, &ty)?;
        out_params.push(OutParam {
          index: record.index,
          type_name: ty.name().to_string(),
          value,
        });
      }
    }
  }

  Ok(CallOutcome {
    return_value: ReturnValue {
      type_name: return_type.to_string(),
      value: return_value,
    },
    out_params,
  })
}

unsafe fn prepare_argument(
  index: usize,
  descriptor: &ArgDescriptor,
  structs: &StructRegistry,
  callbacks: &CallbackRegistry,
  arena: &mut ArgArena,
  records: &mut Vec<OutParamRecord>,
) -> Result<*mut u8, CallError> {
  let type_name = descriptor.type_name.as_str();

  match descriptor.direction {
    Direction::Out => {
      if type_name != "buffer" {
        return Err(CallError::InvalidDirection {
          direction: descriptor.direction.name(),
          type_name: type_name.to_string(),
        });
      }
      prepare_buffer(index, descriptor, arena, records)
    }
    Direction::Inout => match type_name {
      "buffer" => prepare_buffer(index, descriptor, arena, records),
      "pointer" => {
        let target =
          descriptor.target_type.as_ref().ok_or(CallError::MissingField {
            index,
            field: "target_type",
          })?;
        let ty = structs.element_type(target)?;
        let storage = arena.aggregate(ty.size(), ty.alignment())?;
        ir::populate(storage, &descriptor.value, &ty, arena)?;
        records.push(OutParamRecord {
          index,
          kind: OutParamKind::Target(ty),
          storage,
        });
        Ok(arena.indirection(storage as *mut c_void))
      }
      _ => Err(CallError::InvalidDirection {
        direction: descriptor.direction.name(),
        type_name: type_name.to_string(),
      }),
    },
    Direction::In => prepare_in_argument(
      index, descriptor, structs, callbacks, arena, records,
    ),
  }
}

unsafe fn prepare_in_argument(
  index: usize,
  descriptor: &ArgDescriptor,
  structs: &StructRegistry,
  callbacks: &CallbackRegistry,
  arena: &mut ArgArena,
  records: &mut Vec<OutParamRecord>,
) -> Result<*mut u8, CallError> {
  let type_name = descriptor.type_name.as_str();

  // A registered aggregate passed by value.
  if let Some(layout) = structs.resolve(type_name) {
    let ty = ElementType::Aggregate(layout);
    let storage = arena
      .aggregate(ty.size(), ty.alignment().max(align_of::<*const c_void>()))?;
    ir::populate(storage, &descriptor.value, &ty, arena)?;
    return Ok(storage);
  }

  let Some(native) = NativeType::from_name(type_name) else {
    return Err(CallError::UnknownType(type_name.to_string()));
  };

  match native {
    NativeType::Pointer => {
      if let Some(target) = descriptor.target_type.as_deref() {
        if let Some(element_name) = target.strip_suffix("[]") {
          return prepare_array(descriptor, element_name, structs, arena);
        }
        if let Some(layout) = structs.resolve(target) {
          let ty = ElementType::Aggregate(layout);
          let storage = arena.aggregate(
            ty.size(),
            ty.alignment().max(align_of::<*const c_void>()),
          )?;
          ir::populate(storage, &descriptor.value, &ty, arena)?;
          return Ok(arena.indirection(storage as *mut c_void));
        }
        // Any other target falls through to the literal address below.
      }
      let cell = arena.aggregate(
        size_of::<*const c_void>(),
        align_of::<*const c_void>(),
      )?;
      ir::populate(
        cell,
        &descriptor.value,
        &ElementType::Scalar(NativeType::Pointer),
        arena,
      )?;
      Ok(cell)
    }
    NativeType::String => {
      let cell = arena.aggregate(
        size_of::<*const c_void>(),
        align_of::<*const c_void>(),
      )?;
      ir::populate(
        cell,
        &descriptor.value,
        &ElementType::Scalar(NativeType::String),
        arena,
      )?;
      Ok(cell)
    }
    NativeType::Callback => {
      let callback_id = descriptor
        .value
        .as_str()
        .ok_or(CallError::ExpectedCallbackId(index))?;
      let address = callbacks.trampoline_address(callback_id)?;
      Ok(arena.indirection(address as *mut c_void))
    }
    NativeType::Buffer => prepare_buffer(index, descriptor, arena, records),
    NativeType::Void | NativeType::BufferPtr => {
      Err(CallError::InvalidArgumentType(type_name.to_string()))
    }
    scalar => {
      let ty = ElementType::Scalar(scalar);
      let storage = arena.aggregate(ty.size(), ty.alignment())?;
      ir::populate(storage, &descriptor.value, &ty, arena)?;
      Ok(storage)
    }
  }
}

unsafe fn prepare_array(
  descriptor: &ArgDescriptor,
  element_name: &str,
  structs: &StructRegistry,
  arena: &mut ArgArena,
) -> Result<*mut u8, CallError> {
  let element_ty = structs.element_type(element_name)?;
  let Value::Array(elements) = &descriptor.value else {
    return Err(CallError::ExpectedArray(format!("{element_name}[]")));
  };
  let element_size = element_ty.size();
  let total_size = elements
    .len()
    .checked_mul(element_size)
    .ok_or_else(|| CallError::ArrayTooLarge(element_name.to_string()))?;
  let base = arena.array(
    total_size,
    element_ty.alignment().max(align_of::<*const c_void>()),
  )?;
  for (i, element) in elements.iter().enumerate() {
    ir::populate(base.add(i * element_size), element, &element_ty, arena)?;
  }
  Ok(arena.indirection(base as *mut c_void))
}

unsafe fn prepare_buffer(
  index: usize,
  descriptor: &ArgDescriptor,
  arena: &mut ArgArena,
  records: &mut Vec<OutParamRecord>,
) -> Result<*mut u8, CallError> {
  let size = descriptor.size.ok_or(CallError::MissingField {
    index,
    field: "size",
  })?;
  if size < 0 {
    return Err(CallError::NegativeBufferSize(size));
  }
  let capacity = size as usize;
  // Over-allocated by one machine word like the return slot.
  let storage = arena.array(
    capacity + size_of::<usize>(),
    align_of::<*const c_void>(),
  )?;

  match &descriptor.value {
    Value::Null => {}
    Value::String(encoded) => {
      let decoded =
        base64::engine::general_purpose::STANDARD.decode(encoded)?;
      if decoded.len() > capacity {
        return Err(CallError::BufferTooLong {
          length: decoded.len(),
          capacity,
        });
      }
      // SAFETY: decoded.len() <= capacity bytes were allocated above.
      std::ptr::copy_nonoverlapping(
        decoded.as_ptr(),
        storage,
        decoded.len(),
      );
    }
    _ => return Err(CallError::InvalidBufferValue(index)),
  }

  if descriptor.direction != Direction::In {
    records.push(OutParamRecord {
      index,
      kind: OutParamKind::Buffer { capacity },
      storage,
    });
  }
  Ok(arena.indirection(storage as *mut c_void))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::callback::EventSink;
  use crate::layout::StructMemberDef;
  use parking_lot::Mutex;
  use pretty_assertions::assert_eq;
  use serde_json::json;
  use std::ffi::c_char;
  use std::ffi::CStr;
  use std::ffi::CString;
  use std::sync::Arc;

  #[repr(C)]
  #[derive(Clone, Copy)]
  struct Point {
    x: i32,
    y: i32,
  }

  #[repr(C)]
  struct Line {
    p1: Point,
    p2: Point,
  }

  extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
  }

  extern "C" fn add_u64(a: u64, b: u64) -> u64 {
    a.wrapping_add(b)
  }

  extern "C" fn average(a: f64, b: f32) -> f64 {
    (a + b as f64) / 2.0
  }

  extern "C" fn greet(name: *const c_char) -> *const c_char {
    // SAFETY: test callers pass a NUL-terminated string.
    let name = unsafe { CStr::from_ptr(name) }.to_str().unwrap();
    CString::new(format!("Hello, {name}")).unwrap().into_raw()
  }

  extern "C" fn string_identity(s: *const c_char) -> *const c_char {
    s
  }

  extern "C" fn process_point_by_val(p: Point) -> i32 {
    p.x + p.y
  }

  extern "C" fn process_point_by_ptr(p: *const Point) -> i32 {
    // SAFETY: test callers pass a valid Point.
    let p = unsafe { &*p };
    p.x + p.y
  }

  extern "C" fn create_point(x: i32, y: i32) -> Point {
    Point { x, y }
  }

  extern "C" fn get_line_length(l: Line) -> i32 {
    l.p1.x + l.p1.y + l.p2.x + l.p2.y
  }

  extern "C" fn sum_points(points: *const Point, count: i32) -> i32 {
    // SAFETY: test callers pass `count` contiguous Points.
    let points = unsafe { std::slice::from_raw_parts(points, count as usize) };
    points.iter().map(|p| p.x + p.y).sum()
  }

  extern "C" fn process_buffer_inout(buf: *mut u8, size: *mut i32) -> i32 {
    // SAFETY: test callers pass a buffer of at least 4 bytes and a valid
    // size pointer.
    unsafe {
      assert_eq!(*buf, 0x05);
      buf.copy_from(b"\xAA\x06\xDE\xAD".as_ptr(), 4);
      *size = 4;
    }
    0
  }

  extern "C" fn invoke_callback(cb: extern "C" fn(i32, i32), seed: i32) {
    cb(seed, seed * 2)
  }

  #[derive(Default)]
  struct NullSink;

  impl EventSink for NullSink {
    fn send_event(&self, _event: &serde_json::Value) -> std::io::Result<()> {
      Ok(())
    }
  }

  #[derive(Default)]
  struct CaptureSink {
    events: Mutex<Vec<serde_json::Value>>,
  }

  impl EventSink for CaptureSink {
    fn send_event(&self, event: &serde_json::Value) -> std::io::Result<()> {
      self.events.lock().push(event.clone());
      Ok(())
    }
  }

  fn registries() -> (Arc<StructRegistry>, CallbackRegistry) {
    let structs = Arc::new(StructRegistry::new());
    let callbacks =
      CallbackRegistry::new(structs.clone(), Arc::new(NullSink));
    (structs, callbacks)
  }

  fn register_point(structs: &StructRegistry) {
    structs
      .register(
        "Point",
        &[
          StructMemberDef {
            name: "x".to_string(),
            type_name: "int32".to_string(),
          },
          StructMemberDef {
            name: "y".to_string(),
            type_name: "int32".to_string(),
          },
        ],
      )
      .unwrap();
  }

  fn args_from(value: serde_json::Value) -> Vec<ArgDescriptor> {
    serde_json::from_value(value).unwrap()
  }

  fn call(
    func_ptr: *const c_void,
    return_type: &str,
    args: serde_json::Value,
    structs: &StructRegistry,
    callbacks: &CallbackRegistry,
  ) -> Result<CallOutcome, CallError> {
    let args = args_from(args);
    // SAFETY: each test passes a function matching its descriptors.
    unsafe {
      call_function(func_ptr, return_type, &args, structs, callbacks)
    }
  }

  #[test]
  fn basic_add() {
    let (structs, callbacks) = registries();
    let outcome = call(
      add as *const c_void,
      "int32",
      json!([
        { "type": "int32", "value": 10 },
        { "type": "int32", "value": 20 },
      ]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.type_name, "int32");
    assert_eq!(outcome.return_value.value, json!(30));
    assert!(outcome.out_params.is_empty());
  }

  #[test]
  fn wide_and_float_arguments() {
    let (structs, callbacks) = registries();
    let outcome = call(
      add_u64 as *const c_void,
      "uint64",
      json!([
        { "type": "uint64", "value": u64::MAX - 4 },
        { "type": "uint64", "value": 3 },
      ]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!(u64::MAX - 1));

    let outcome = call(
      average as *const c_void,
      "double",
      json!([
        { "type": "double", "value": 3.0 },
        { "type": "float", "value": 1.0 },
      ]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!(2.0));
  }

  #[test]
  fn string_round_trip() {
    let (structs, callbacks) = registries();
    let outcome = call(
      greet as *const c_void,
      "string",
      json!([{ "type": "string", "value": "World" }]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!("Hello, World"));
  }

  #[test]
  fn null_string_argument_and_return() {
    let (structs, callbacks) = registries();
    let outcome = call(
      string_identity as *const c_void,
      "string",
      json!([{ "type": "string", "value": null }]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, Value::Null);
  }

  #[test]
  fn struct_by_value() {
    let (structs, callbacks) = registries();
    register_point(&structs);
    let outcome = call(
      process_point_by_val as *const c_void,
      "int32",
      json!([{ "type": "Point", "value": { "x": 10, "y": 20 } }]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!(30));
  }

  #[test]
  fn struct_behind_pointer() {
    let (structs, callbacks) = registries();
    register_point(&structs);
    let outcome = call(
      process_point_by_ptr as *const c_void,
      "int32",
      json!([{
        "type": "pointer",
        "target_type": "Point",
        "value": { "x": 5, "y": 6 },
      }]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!(11));
  }

  #[test]
  fn struct_return_value() {
    let (structs, callbacks) = registries();
    register_point(&structs);
    let outcome = call(
      create_point as *const c_void,
      "Point",
      json!([
        { "type": "int32", "value": 100 },
        { "type": "int32", "value": 200 },
      ]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!({ "x": 100, "y": 200 }));
  }

  #[test]
  fn nested_struct_by_value() {
    let (structs, callbacks) = registries();
    register_point(&structs);
    structs
      .register(
        "Line",
        &[
          StructMemberDef {
            name: "p1".to_string(),
            type_name: "Point".to_string(),
          },
          StructMemberDef {
            name: "p2".to_string(),
            type_name: "Point".to_string(),
          },
        ],
      )
      .unwrap();
    let outcome = call(
      get_line_length as *const c_void,
      "int32",
      json!([{
        "type": "Line",
        "value": {
          "p1": { "x": 1, "y": 2 },
          "p2": { "x": 3, "y": 4 },
        },
      }]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!(10));
  }

  #[test]
  fn array_of_structs() {
    let (structs, callbacks) = registries();
    register_point(&structs);
    let outcome = call(
      sum_points as *const c_void,
      "int32",
      json!([
        {
          "type": "pointer",
          "target_type": "Point[]",
          "value": [
            { "x": 1, "y": 1 },
            { "x": 2, "y": 2 },
            { "x": 3, "y": 3 },
          ],
        },
        { "type": "int32", "value": 3 },
      ]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!(12));
  }

  #[test]
  fn buffer_inout_with_size_pointer() {
    let (structs, callbacks) = registries();
    let outcome = call(
      process_buffer_inout as *const c_void,
      "int32",
      json!([
        {
          "type": "buffer",
          "direction": "inout",
          "size": 64,
          "value": "BQ==",
        },
        {
          "type": "pointer",
          "target_type": "int32",
          "direction": "inout",
          "value": 64,
        },
      ]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!(0));
    assert_eq!(outcome.out_params.len(), 2);

    let buffer = &outcome.out_params[0];
    assert_eq!(buffer.index, 0);
    assert_eq!(buffer.type_name, "buffer");
    let decoded = base64::engine::general_purpose::STANDARD
      .decode(buffer.value.as_str().unwrap())
      .unwrap();
    // The full declared capacity comes back, with the written prefix.
    assert_eq!(decoded.len(), 64);
    assert_eq!(&decoded[..4], b"\xAA\x06\xDE\xAD");
    assert!(decoded[4..].iter().all(|&b| b == 0));

    let size = &outcome.out_params[1];
    assert_eq!(size.index, 1);
    assert_eq!(size.type_name, "int32");
    assert_eq!(size.value, json!(4));
  }

  #[test]
  fn in_buffer_never_appears_in_out_params() {
    extern "C" fn first_byte(buf: *const u8) -> i32 {
      // SAFETY: test passes a buffer of at least one byte.
      unsafe { *buf as i32 }
    }

    let (structs, callbacks) = registries();
    let outcome = call(
      first_byte as *const c_void,
      "int32",
      json!([{
        "type": "buffer",
        "direction": "in",
        "size": 8,
        "value": "BQ==",
      }]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!(5));
    assert!(outcome.out_params.is_empty());
  }

  #[test]
  fn out_buffer_starts_zeroed() {
    extern "C" fn fill(buf: *mut u8) -> i32 {
      // SAFETY: test passes a buffer of at least two bytes.
      unsafe {
        *buf = 1;
        *buf.add(1) = 2;
      }
      0
    }

    let (structs, callbacks) = registries();
    let outcome = call(
      fill as *const c_void,
      "int32",
      json!([{ "type": "buffer", "direction": "out", "size": 4 }]),
      &structs,
      &callbacks,
    )
    .unwrap();
    let decoded = base64::engine::general_purpose::STANDARD
      .decode(outcome.out_params[0].value.as_str().unwrap())
      .unwrap();
    assert_eq!(decoded, vec![1, 2, 0, 0]);
  }

  #[test]
  fn callback_argument_dispatches_through_trampoline() {
    let structs = Arc::new(StructRegistry::new());
    let sink = Arc::new(CaptureSink::default());
    let callbacks = CallbackRegistry::new(structs.clone(), sink.clone());
    let id = callbacks
      .register(
        "void",
        &[
          crate::callback::CallbackArgSpec::Name("int32".to_string()),
          crate::callback::CallbackArgSpec::Name("int32".to_string()),
        ],
      )
      .unwrap();

    let outcome = call(
      invoke_callback as *const c_void,
      "void",
      json!([
        { "type": "callback", "value": id },
        { "type": "int32", "value": 21 },
      ]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, Value::Null);

    let events = sink.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(
      events[0]["payload"]["args"],
      json!([
        { "type": "int32", "value": 21 },
        { "type": "int32", "value": 42 },
      ])
    );
  }

  #[test]
  fn pointer_passes_literal_address() {
    extern "C" fn deref(p: *const i32) -> i32 {
      // SAFETY: test passes the address of a live i32.
      unsafe { *p }
    }

    let (structs, callbacks) = registries();
    let target = 77i32;
    let outcome = call(
      deref as *const c_void,
      "int32",
      json!([{
        "type": "pointer",
        "value": &target as *const i32 as usize as u64,
      }]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.return_value.value, json!(77));
  }

  #[test]
  fn failures_precede_invocation() {
    extern "C" fn must_not_run() -> i32 {
      panic!("the call must fail before reaching the target");
    }

    let (structs, callbacks) = registries();
    let cases = [
      json!([{ "type": "NoSuchStruct", "value": {} }]),
      json!([{ "type": "int32" }]),
      json!([{ "type": "buffer", "direction": "out" }]),
      json!([{ "type": "buffer", "direction": "out", "size": -1 }]),
      json!([{ "type": "buffer", "direction": "in", "size": 1,
               "value": "AAAA" }]),
      json!([{ "type": "buffer", "direction": "in", "size": 4,
               "value": "not base64!" }]),
      json!([{ "type": "int32", "direction": "out", "value": 1 }]),
      json!([{ "type": "string", "direction": "inout", "value": "x" }]),
      json!([{ "type": "pointer", "direction": "inout", "value": 1 }]),
      json!([{ "type": "callback", "value": "cb-missing" }]),
      json!([{ "type": "pointer", "target_type": "Point[]", "value": [] }]),
      json!([{ "type": "void", "value": 0 }]),
    ];
    for case in cases {
      call(
        must_not_run as *const c_void,
        "int32",
        case,
        &structs,
        &callbacks,
      )
      .unwrap_err();
    }
    // Unknown return types fail before invocation too.
    call(must_not_run as *const c_void, "Mystery", json!([]), &structs,
         &callbacks)
      .unwrap_err();
    call(must_not_run as *const c_void, "buffer", json!([]), &structs,
         &callbacks)
      .unwrap_err();
  }

  #[test]
  fn void_return() {
    extern "C" fn noop() {}

    let (structs, callbacks) = registries();
    let outcome =
      call(noop as *const c_void, "void", json!([]), &structs, &callbacks)
        .unwrap();
    assert_eq!(outcome.return_value.type_name, "void");
    assert_eq!(outcome.return_value.value, Value::Null);
  }

  #[test]
  fn inout_scalar_updates_round_trip() {
    extern "C" fn double_in_place(v: *mut i64) {
      // SAFETY: test passes a valid i64 pointer.
      unsafe { *v *= 2 };
    }

    let (structs, callbacks) = registries();
    let outcome = call(
      double_in_place as *const c_void,
      "void",
      json!([{
        "type": "pointer",
        "target_type": "int64",
        "direction": "inout",
        "value": -21,
      }]),
      &structs,
      &callbacks,
    )
    .unwrap();
    assert_eq!(outcome.out_params.len(), 1);
    assert_eq!(outcome.out_params[0].type_name, "int64");
    assert_eq!(outcome.out_params[0].value, json!(-42));
  }
}
