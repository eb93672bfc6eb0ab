//! Access control.
//!
//! Authentication is a thin bearer-JWT check: the token identifies the
//! owning user (the `sub` claim, a UUID) and nothing else. Issuing tokens
//! (registration, login, password hashing) is handled by an external
//! service; this crate only verifies them and uses the resulting user ID
//! for ownership checks on files and upload sessions.

pub mod http;
