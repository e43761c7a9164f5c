#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    unreachable_pub,
)]
#![allow(
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::missing_errors_doc, // TODO: add error docs
    clippy::missing_panics_doc,
    clippy::shadow_same, // Not too much bad
    clippy::shadow_reuse, // Not too much bad
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
)]
//! Socket multiplexing building blocks: readiness polling, a reactor and
//! a proactor dispatch loop, notification queues and an asynchronous
//! notification center.

/// Asynchronous publish/subscribe notification delivery.
pub mod center;

/// Shared infrastructure for the dispatch loops.
pub mod common;

/// The process-wide error reporting hook.
pub mod error;

/// Socket readiness polling and the dispatch loops.
pub mod net;

/// Thread-safe queues for payload hand-off.
pub mod queue;

pub use center::{AsyncNotificationCenter, DispatchMode, Notification};
pub use common::constants::RunState;
pub use net::poll_set::PollSet;
pub use net::proactor::{IoCallback, IoEvent, SocketProactor};
pub use net::reactor::{observer, EventKind, Params, SocketEvent, SocketObserver, SocketReactor};
pub use net::worker::{Work, Worker};
pub use net::{Interest, SocketKind};
pub use queue::mpsc::MpscQueue;
pub use queue::spsc::SpscQueue;
pub use queue::NotificationQueue;
