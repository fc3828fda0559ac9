//! Block buffers, XOR helpers and the logical-to-physical sector mapping.

pub mod block;
pub mod mapper;
