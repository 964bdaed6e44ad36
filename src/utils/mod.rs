//! Utility functions for working with A2A types.
//!
//! This module provides helper functions for creating and manipulating A2A protocol types,
//! making it easier to work with messages, artifacts, parts, and tasks.

pub mod artifact;
pub mod constants;
pub mod extensions;
pub mod message;
pub mod parts;
pub mod task;

pub use artifact::*;
pub use constants::*;
pub use extensions::*;
pub use message::*;
pub use parts::*;
pub use task::*;
