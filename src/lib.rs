//! Galago extracts embedded secrets (XXTEA keys, signatures, generic crypto
//! keys) from ARM64 Android shared objects by running just enough of their
//! native code inside a synthetic CPU and address space. Only the state
//! needed to reach a key-assigning call is materialized: a fixed memory map,
//! a mock C++ object graph, libc/pthread/JNI/Lua stub surfaces, and capture
//! hooks on anything that looks like a key setter.

pub mod driver;
pub mod emu;
pub mod profile;
pub mod stubs;
pub mod trace;
