//! Small, dependency-light helpers shared between `reap-engine` and `reapd`:
//! fd-passing over unix sockets and page-size/id helpers.

pub mod ids;
pub mod sock_ctrl_msg;

pub use ids::page_size;
