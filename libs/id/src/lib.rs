//! # keel-id
//!
//! Stable identifier and version types shared by every keel component.
//!
//! ## Design Principles
//!
//! - Object uids are system-generated and never change for the lifetime of
//!   an object, even when a new object is later created under the same name
//! - All typed IDs have a canonical string representation with strict parsing
//! - IDs are typed to prevent mixing an object uid with a request id
//! - Versions (`ResourceVersion`, `Generation`) are plain monotonic counters
//!
//! ## ID Format
//!
//! Typed IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `uid_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `hld_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `req_01HV4Z4NYPLTRS0JTUA8XDME5F`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
