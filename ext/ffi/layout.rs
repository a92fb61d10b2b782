// Copyright 2018-2025 the Deno authors. MIT license.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::symbol::NativeType;

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
  #[error("Struct '{0}' already registered")]
  DuplicateStruct(String),
  #[error("Struct name '{0}' conflicts with a built-in type")]
  ReservedName(String),
  #[error("Duplicate member '{member}' in struct '{struct_name}'")]
  DuplicateMember { struct_name: String, member: String },
  #[error("Unknown type: {0}")]
  UnknownType(String),
  #[error("Type '{0}' is not allowed as a struct member")]
  InvalidMemberType(String),
  #[error("Struct '{0}' not found")]
  UnknownStruct(String),
}

/// One member definition as it appears in a `register_struct` payload.
#[derive(Clone, Debug, Deserialize)]
pub struct StructMemberDef {
  pub name: String,
  #[serde(rename = "type")]
  pub type_name: String,
}

/// A fully resolved element type: either a built-in scalar or a registered
/// aggregate captured by reference. Aggregates referenced from other layouts
/// or live callbacks stay alive through the `Arc` even after unregistration.
#[derive(Clone)]
pub enum ElementType {
  Scalar(NativeType),
  Aggregate(Arc<StructLayout>),
}

impl ElementType {
  pub fn size(&self) -> usize {
    match self {
      ElementType::Scalar(ty) => ty.size(),
      ElementType::Aggregate(layout) => layout.size,
    }
  }

  pub fn alignment(&self) -> usize {
    match self {
      ElementType::Scalar(ty) => ty.alignment(),
      ElementType::Aggregate(layout) => layout.alignment,
    }
  }

  pub fn name(&self) -> &str {
    match self {
      ElementType::Scalar(ty) => ty.name(),
      ElementType::Aggregate(layout) => &layout.name,
    }
  }

  pub fn ffi_type(&self) -> libffi::middle::Type {
    match self {
      ElementType::Scalar(ty) => (*ty).into(),
      ElementType::Aggregate(layout) => layout.ffi_type.clone(),
    }
  }
}

pub struct StructMember {
  pub name: String,
  pub ty: ElementType,
  pub offset: usize,
  pub size: usize,
  pub alignment: usize,
}

/// Memory layout of a registered aggregate plus the call-interface
/// descriptor built from its member descriptors.
pub struct StructLayout {
  pub name: String,
  pub members: Vec<StructMember>,
  pub size: usize,
  pub alignment: usize,
  pub ffi_type: libffi::middle::Type,
}

#[allow(clippy::non_send_fields_in_send_ty)]
// SAFETY: the libffi type descriptor is immutable once built and is only
// read by trampolines on foreign threads.
unsafe impl Send for StructLayout {}
// SAFETY: see above.
unsafe impl Sync for StructLayout {}

fn align_up(offset: usize, alignment: usize) -> usize {
  debug_assert!(alignment.is_power_of_two());
  (offset + alignment - 1) & !(alignment - 1)
}

/// Per-session registry of aggregate layouts. Registration and removal
/// happen on the session worker; trampolines resolve layouts from whatever
/// thread native code invokes them on.
#[derive(Default)]
pub struct StructRegistry {
  structs: RwLock<HashMap<String, Arc<StructLayout>>>,
}

impl StructRegistry {
  pub fn new() -> StructRegistry {
    StructRegistry::default()
  }

  /// Resolves a type name to a member-position element type. Member types
  /// resolve at registration time only, so aggregates may nest but never
  /// reference a struct registered later.
  pub fn element_type(&self, name: &str) -> Result<ElementType, LayoutError> {
    if let Some(ty) = NativeType::from_name(name) {
      return match ty {
        NativeType::Void
        | NativeType::Callback
        | NativeType::Buffer
        | NativeType::BufferPtr => {
          Err(LayoutError::InvalidMemberType(name.to_string()))
        }
        _ => Ok(ElementType::Scalar(ty)),
      };
    }
    self
      .resolve(name)
      .map(ElementType::Aggregate)
      .ok_or_else(|| LayoutError::UnknownType(name.to_string()))
  }

  pub fn register(
    &self,
    name: &str,
    definition: &[StructMemberDef],
  ) -> Result<(), LayoutError> {
    if NativeType::from_name(name).is_some() {
      return Err(LayoutError::ReservedName(name.to_string()));
    }
    if self.structs.read().contains_key(name) {
      return Err(LayoutError::DuplicateStruct(name.to_string()));
    }

    let mut seen = HashSet::new();
    let mut members = Vec::with_capacity(definition.len());
    let mut element_types = Vec::with_capacity(definition.len());
    let mut offset = 0;
    let mut max_alignment = 1;

    for member_def in definition {
      if !seen.insert(member_def.name.as_str()) {
        return Err(LayoutError::DuplicateMember {
          struct_name: name.to_string(),
          member: member_def.name.clone(),
        });
      }
      let ty = self.element_type(&member_def.type_name)?;
      let size = ty.size();
      let alignment = ty.alignment();

      offset = align_up(offset, alignment);
      max_alignment = max_alignment.max(alignment);
      element_types.push(ty.ffi_type());
      members.push(StructMember {
        name: member_def.name.clone(),
        ty,
        offset,
        size,
        alignment,
      });
      offset += size;
    }

    let layout = Arc::new(StructLayout {
      name: name.to_string(),
      members,
      size: align_up(offset, max_alignment),
      alignment: max_alignment,
      ffi_type: libffi::middle::Type::structure(element_types),
    });

    let mut structs = self.structs.write();
    if structs.contains_key(name) {
      return Err(LayoutError::DuplicateStruct(name.to_string()));
    }
    structs.insert(name.to_string(), layout);
    Ok(())
  }

  /// Removes the binding. Layouts captured inside other structures or live
  /// callback registrations keep their own references.
  pub fn unregister(&self, name: &str) -> Result<(), LayoutError> {
    self
      .structs
      .write()
      .remove(name)
      .map(|_| ())
      .ok_or_else(|| LayoutError::UnknownStruct(name.to_string()))
  }

  pub fn resolve(&self, name: &str) -> Option<Arc<StructLayout>> {
    self.structs.read().get(name).cloned()
  }
}
