//! HTTP side of the console.
//!
//! This module provides:
//! - `Endpoint`: closed declarations of every server endpoint, with the tags
//!   each one provides or invalidates
//! - `Dispatcher`: the single path every request takes, which attaches the
//!   bearer credential and turns a 401 into a forced sign-out
//! - `QueryError`: the error taxonomy stored in cache entries

pub mod dispatch;
pub mod endpoint;
pub mod error;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointKind, PathTemplate, TagTemplate, Transform};
pub use error::{EndpointError, QueryError};
