// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::c_char;
use std::ffi::c_void;
use std::ffi::CStr;

use serde_json::Number;
use serde_json::Value;

use crate::arena::ArenaError;
use crate::arena::ArgArena;
use crate::layout::ElementType;
use crate::symbol::NativeType;

#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
  #[error("Expected a number for type '{0}'")]
  ExpectedNumber(&'static str),
  #[error("Expected a string or null for type 'string'")]
  ExpectedString,
  #[error("Expected an object for struct '{0}'")]
  ExpectedObject(String),
  #[error("Missing member '{member}' in struct data for type '{struct_name}'")]
  MissingMember { struct_name: String, member: String },
  #[error("String arguments may not contain NUL bytes")]
  NulInString,
  #[error("Type '{0}' cannot be populated from a value")]
  Unpopulatable(&'static str),
  #[error("Type '{0}' cannot be read back as a value")]
  Unreadable(&'static str),
  #[error(transparent)]
  Arena(#[from] ArenaError),
}

fn expect_i64(value: &Value, ty: &'static str) -> Result<i64, MarshalError> {
  value
    .as_i64()
    .or_else(|| value.as_u64().map(|v| v as i64))
    .ok_or(MarshalError::ExpectedNumber(ty))
}

fn expect_u64(value: &Value, ty: &'static str) -> Result<u64, MarshalError> {
  value
    .as_u64()
    .or_else(|| value.as_i64().map(|v| v as u64))
    .ok_or(MarshalError::ExpectedNumber(ty))
}

fn expect_f64(value: &Value, ty: &'static str) -> Result<f64, MarshalError> {
  value.as_f64().ok_or(MarshalError::ExpectedNumber(ty))
}

/// Writes `value` into raw memory at `dest` according to `ty`. Numeric
/// values coerce with wrapping narrowing to the target width; strings are
/// copied into the arena and stored as a pointer; aggregates recurse
/// member-by-member through the registered layout.
///
/// # Safety
///
/// `dest` must be valid for writes of `ty.size()` bytes and aligned to
/// `ty.alignment()`.
pub unsafe fn populate(
  dest: *mut u8,
  value: &Value,
  ty: &ElementType,
  arena: &mut ArgArena,
) -> Result<(), MarshalError> {
  match ty {
    ElementType::Scalar(scalar) => match scalar {
      NativeType::Int8 => {
        *(dest as *mut i8) = expect_i64(value, "int8")? as i8;
      }
      NativeType::Uint8 => {
        *dest = expect_u64(value, "uint8")? as u8;
      }
      NativeType::Int16 => {
        *(dest as *mut i16) = expect_i64(value, "int16")? as i16;
      }
      NativeType::Uint16 => {
        *(dest as *mut u16) = expect_u64(value, "uint16")? as u16;
      }
      NativeType::Int32 => {
        *(dest as *mut i32) = expect_i64(value, "int32")? as i32;
      }
      NativeType::Uint32 => {
        *(dest as *mut u32) = expect_u64(value, "uint32")? as u32;
      }
      NativeType::Int64 => {
        *(dest as *mut i64) = expect_i64(value, "int64")?;
      }
      NativeType::Uint64 => {
        *(dest as *mut u64) = expect_u64(value, "uint64")?;
      }
      NativeType::Float => {
        *(dest as *mut f32) = expect_f64(value, "float")? as f32;
      }
      NativeType::Double => {
        *(dest as *mut f64) = expect_f64(value, "double")?;
      }
      NativeType::String => {
        let ptr = match value {
          Value::Null => std::ptr::null_mut(),
          Value::String(s) => {
            if s.as_bytes().contains(&0) {
              return Err(MarshalError::NulInString);
            }
            arena.string(s)?
          }
          _ => return Err(MarshalError::ExpectedString),
        };
        *(dest as *mut *mut u8) = ptr;
      }
      NativeType::Pointer => {
        let address = match value {
          Value::Null => 0,
          _ => expect_u64(value, "pointer")?,
        };
        *(dest as *mut *mut c_void) = address as usize as *mut c_void;
      }
      NativeType::Void
      | NativeType::Callback
      | NativeType::Buffer
      | NativeType::BufferPtr => {
        return Err(MarshalError::Unpopulatable(scalar.name()));
      }
    },
    ElementType::Aggregate(layout) => {
      let Value::Object(object) = value else {
        return Err(MarshalError::ExpectedObject(layout.name.clone()));
      };
      for member in &layout.members {
        let member_value = object.get(&member.name).ok_or_else(|| {
          MarshalError::MissingMember {
            struct_name: layout.name.clone(),
            member: member.name.clone(),
          }
        })?;
        populate(dest.add(member.offset), member_value, &member.ty, arena)?;
      }
    }
  }
  Ok(())
}

/// Reads raw memory at `src` back into a JSON value according to `ty`.
/// The inverse of [`populate`]: null `char*` reads as JSON null, pointers
/// read as their numeric address, aggregates recurse. Pure over
/// `(src, ty)`, so trampolines may call it from any thread.
///
/// # Safety
///
/// `src` must be valid for reads of `ty.size()` bytes and aligned to
/// `ty.alignment()`. A `string` slot must hold null or a pointer to a
/// NUL-terminated sequence.
pub unsafe fn read(
  src: *const u8,
  ty: &ElementType,
) -> Result<Value, MarshalError> {
  Ok(match ty {
    ElementType::Scalar(scalar) => match scalar {
      NativeType::Int8 => Value::from(*(src as *const i8)),
      NativeType::Uint8 => Value::from(*src),
      NativeType::Int16 => Value::from(*(src as *const i16)),
      NativeType::Uint16 => Value::from(*(src as *const u16)),
      NativeType::Int32 => Value::from(*(src as *const i32)),
      NativeType::Uint32 => Value::from(*(src as *const u32)),
      NativeType::Int64 => Value::from(*(src as *const i64)),
      NativeType::Uint64 => Value::from(*(src as *const u64)),
      NativeType::Float => float_value(*(src as *const f32) as f64),
      NativeType::Double => float_value(*(src as *const f64)),
      NativeType::String => {
        let ptr = *(src as *const *const c_char);
        if ptr.is_null() {
          Value::Null
        } else {
          Value::from(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
      }
      NativeType::Pointer => {
        Value::from(*(src as *const *const c_void) as usize as u64)
      }
      NativeType::Void
      | NativeType::Callback
      | NativeType::Buffer
      | NativeType::BufferPtr => {
        return Err(MarshalError::Unreadable(scalar.name()));
      }
    },
    ElementType::Aggregate(layout) => {
      let mut object = serde_json::Map::with_capacity(layout.members.len());
      for member in &layout.members {
        let value = read(src.add(member.offset), &member.ty)?;
        object.insert(member.name.clone(), value);
      }
      Value::Object(object)
    }
  })
}

// serde_json has no NaN or infinity.
fn float_value(value: f64) -> Value {
  Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}
