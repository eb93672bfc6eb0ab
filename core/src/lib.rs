//! Core primitives shared by the storage service: content hashing,
//! content-defined chunking, the encryption envelope, and small stream
//! utilities used while hashing/compressing data in flight.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod chunking;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod io;
pub mod mime;
#[cfg(target_family = "unix")]
pub mod testing;
pub mod util;

pub use error::{CoreError, CoreResult};
