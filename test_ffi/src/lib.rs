// Copyright 2018-2025 the Deno authors. MIT license.

//! Native test library driven by the integration suite over the wire.

use std::ffi::c_char;
use std::ffi::c_void;
use std::ffi::CStr;
use std::ffi::CString;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Point {
  pub x: i32,
  pub y: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Line {
  pub p1: Point,
  pub p2: Point,
}

#[no_mangle]
pub extern "C" fn add(a: i32, b: i32) -> i32 {
  a + b
}

#[no_mangle]
pub extern "C" fn add_u64(a: u64, b: u64) -> u64 {
  a.wrapping_add(b)
}

#[no_mangle]
pub extern "C" fn greet(name: *const c_char) -> *const c_char {
  // SAFETY: the caller passes a NUL-terminated string.
  let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();
  let message = CString::new(format!("Hello, {name}"))
    .expect("formatted message has no interior NUL");
  // Leaked on purpose; the test process is short-lived.
  message.into_raw()
}

#[no_mangle]
pub extern "C" fn process_point_by_val(p: Point) -> i32 {
  p.x + p.y
}

#[no_mangle]
pub extern "C" fn process_point_by_ptr(p: *const Point) -> i32 {
  // SAFETY: the caller passes a valid Point.
  let p = unsafe { &*p };
  p.x + p.y
}

#[no_mangle]
pub extern "C" fn create_point(x: i32, y: i32) -> Point {
  Point { x, y }
}

#[no_mangle]
pub extern "C" fn create_line(x1: i32, y1: i32, x2: i32, y2: i32) -> Line {
  Line {
    p1: Point { x: x1, y: y1 },
    p2: Point { x: x2, y: y2 },
  }
}

#[no_mangle]
pub extern "C" fn get_line_length(l: Line) -> i32 {
  l.p1.x + l.p1.y + l.p2.x + l.p2.y
}

#[no_mangle]
pub extern "C" fn sum_points(points: *const Point, count: i32) -> i32 {
  // SAFETY: the caller passes `count` contiguous Points.
  let points =
    unsafe { std::slice::from_raw_parts(points, count as usize) };
  points.iter().map(|p| p.x + p.y).sum()
}

/// Reads the first byte of `buf`, overwrites the head of the buffer with a
/// fixed marker and reports the written length through `size`.
#[no_mangle]
pub extern "C" fn process_buffer_inout(buf: *mut u8, size: *mut i32) -> i32 {
  // SAFETY: the caller passes a buffer of at least 4 bytes and a valid
  // size pointer.
  unsafe {
    if *buf != 0x05 {
      return 1;
    }
    buf.copy_from(b"\xAA\x06\xDE\xAD".as_ptr(), 4);
    *size = 4;
  }
  0
}

#[no_mangle]
pub extern "C" fn call_my_callback(
  cb: extern "C" fn(*const c_char, i32),
  message: *const c_char,
) {
  cb(message, 123);
}

#[no_mangle]
pub extern "C" fn call_buffer_callback(
  cb: extern "C" fn(i32, *const u8, i32, *const c_void),
) {
  let data = b"DynamicData123";
  cb(99, data.as_ptr(), data.len() as i32, std::ptr::null());
}

#[no_mangle]
pub extern "C" fn call_point_callback(cb: extern "C" fn(Point)) {
  cb(Point { x: 7, y: 8 });
}

/// Invokes the callback from a thread the library owns; the invocation
/// completes before this function returns.
#[no_mangle]
pub extern "C" fn call_callback_from_thread(
  cb: extern "C" fn(*const c_char, i32),
  message: *const c_char,
) {
  let message = message as usize;
  std::thread::spawn(move || {
    cb(message as *const c_char, 456);
  })
  .join()
  .expect("callback thread panicked");
}
