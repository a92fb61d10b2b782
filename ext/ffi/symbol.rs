// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::c_void;
use std::mem::align_of;
use std::mem::size_of;

/// The built-in wire types accepted as parameters, return values and
/// aggregate members.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NativeType {
  Void,
  Int8,
  Uint8,
  Int16,
  Uint16,
  Int32,
  Uint32,
  Int64,
  Uint64,
  Float,
  Double,
  String,
  Pointer,
  Callback,
  Buffer,
  BufferPtr,
}

impl NativeType {
  pub fn from_name(name: &str) -> Option<NativeType> {
    Some(match name {
      "void" => NativeType::Void,
      "int8" => NativeType::Int8,
      "uint8" => NativeType::Uint8,
      "int16" => NativeType::Int16,
      "uint16" => NativeType::Uint16,
      "int32" => NativeType::Int32,
      "uint32" => NativeType::Uint32,
      "int64" => NativeType::Int64,
      "uint64" => NativeType::Uint64,
      "float" => NativeType::Float,
      "double" => NativeType::Double,
      "string" => NativeType::String,
      "pointer" => NativeType::Pointer,
      "callback" => NativeType::Callback,
      "buffer" => NativeType::Buffer,
      "buffer_ptr" => NativeType::BufferPtr,
      _ => return None,
    })
  }

  pub fn name(self) -> &'static str {
    match self {
      NativeType::Void => "void",
      NativeType::Int8 => "int8",
      NativeType::Uint8 => "uint8",
      NativeType::Int16 => "int16",
      NativeType::Uint16 => "uint16",
      NativeType::Int32 => "int32",
      NativeType::Uint32 => "uint32",
      NativeType::Int64 => "int64",
      NativeType::Uint64 => "uint64",
      NativeType::Float => "float",
      NativeType::Double => "double",
      NativeType::String => "string",
      NativeType::Pointer => "pointer",
      NativeType::Callback => "callback",
      NativeType::Buffer => "buffer",
      NativeType::BufferPtr => "buffer_ptr",
    }
  }

  pub fn size(self) -> usize {
    match self {
      NativeType::Void => 0,
      NativeType::Int8 | NativeType::Uint8 => size_of::<u8>(),
      NativeType::Int16 | NativeType::Uint16 => size_of::<u16>(),
      NativeType::Int32 | NativeType::Uint32 => size_of::<u32>(),
      NativeType::Int64 | NativeType::Uint64 => size_of::<u64>(),
      NativeType::Float => size_of::<f32>(),
      NativeType::Double => size_of::<f64>(),
      NativeType::String
      | NativeType::Pointer
      | NativeType::Callback
      | NativeType::Buffer
      | NativeType::BufferPtr => size_of::<*const c_void>(),
    }
  }

  pub fn alignment(self) -> usize {
    match self {
      NativeType::Void => 1,
      NativeType::Int8 | NativeType::Uint8 => align_of::<u8>(),
      NativeType::Int16 | NativeType::Uint16 => align_of::<u16>(),
      NativeType::Int32 | NativeType::Uint32 => align_of::<u32>(),
      NativeType::Int64 | NativeType::Uint64 => align_of::<u64>(),
      NativeType::Float => align_of::<f32>(),
      NativeType::Double => align_of::<f64>(),
      NativeType::String
      | NativeType::Pointer
      | NativeType::Callback
      | NativeType::Buffer
      | NativeType::BufferPtr => align_of::<*const c_void>(),
    }
  }

  pub fn is_integer(self) -> bool {
    matches!(
      self,
      NativeType::Int8
        | NativeType::Uint8
        | NativeType::Int16
        | NativeType::Uint16
        | NativeType::Int32
        | NativeType::Uint32
        | NativeType::Int64
        | NativeType::Uint64
    )
  }
}

impl From<NativeType> for libffi::middle::Type {
  fn from(native_type: NativeType) -> Self {
    match native_type {
      NativeType::Void => libffi::middle::Type::void(),
      NativeType::Int8 => libffi::middle::Type::i8(),
      NativeType::Uint8 => libffi::middle::Type::u8(),
      NativeType::Int16 => libffi::middle::Type::i16(),
      NativeType::Uint16 => libffi::middle::Type::u16(),
      NativeType::Int32 => libffi::middle::Type::i32(),
      NativeType::Uint32 => libffi::middle::Type::u32(),
      NativeType::Int64 => libffi::middle::Type::i64(),
      NativeType::Uint64 => libffi::middle::Type::u64(),
      NativeType::Float => libffi::middle::Type::f32(),
      NativeType::Double => libffi::middle::Type::f64(),
      NativeType::String
      | NativeType::Pointer
      | NativeType::Callback
      | NativeType::Buffer
      | NativeType::BufferPtr => libffi::middle::Type::pointer(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::NativeType;

  #[test]
  fn name_round_trip() {
    for name in [
      "void", "int8", "uint8", "int16", "uint16", "int32", "uint32", "int64",
      "uint64", "float", "double", "string", "pointer", "callback", "buffer",
      "buffer_ptr",
    ] {
      let ty = NativeType::from_name(name).unwrap();
      assert_eq!(ty.name(), name);
    }
    assert_eq!(NativeType::from_name("Point"), None);
    assert_eq!(NativeType::from_name(""), None);
  }

  #[test]
  fn sizes_match_abi() {
    assert_eq!(NativeType::Int8.size(), 1);
    assert_eq!(NativeType::Uint16.size(), 2);
    assert_eq!(NativeType::Int32.size(), 4);
    assert_eq!(NativeType::Double.size(), 8);
    assert_eq!(NativeType::Pointer.size(), 8);
    assert_eq!(NativeType::Void.size(), 0);
    assert_eq!(NativeType::Void.alignment(), 1);
    assert_eq!(NativeType::Int64.alignment(), 8);
  }
}
