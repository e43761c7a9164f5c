//! Socket readiness polling and the two dispatch loops built on it.

pub use selector::Interest;
pub use sys::SocketKind;

pub mod poll_set;
pub mod proactor;
pub mod reactor;
pub(crate) mod selector;
pub(crate) mod sys;
pub mod worker;
