// Copyright 2018-2025 the Deno authors. MIT license.

use std::mem::size_of;
use std::os::raw::c_char;
use std::os::raw::c_short;

pub mod arena;
pub mod call;
pub mod callback;
pub mod dlfcn;
pub mod ir;
pub mod layout;
pub mod symbol;

pub use arena::ArenaError;
pub use arena::ArgArena;
pub use call::call_function;
pub use call::ArgDescriptor;
pub use call::CallError;
pub use call::CallOutcome;
pub use call::Direction;
pub use call::OutParam;
pub use call::ReturnValue;
pub use callback::CallbackArgSpec;
pub use callback::CallbackError;
pub use callback::CallbackRegistry;
pub use callback::EventSink;
pub use dlfcn::DlfcnError;
pub use dlfcn::LibraryRegistry;
pub use ir::MarshalError;
pub use layout::LayoutError;
pub use layout::StructLayout;
pub use layout::StructMemberDef;
pub use layout::StructRegistry;
pub use symbol::NativeType;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("platform not supported");

const _: () = {
  assert!(size_of::<c_char>() == 1);
  assert!(size_of::<c_short>() == 2);
  assert!(size_of::<*const ()>() == 8);
};
