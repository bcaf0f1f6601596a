// Synchronization primitives that switch between std and loom based on feature flag

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU8, Ordering};

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::Mutex;

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU8, Ordering};

#[cfg(feature = "loom")]
pub(crate) use loom::sync::Mutex;
