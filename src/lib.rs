#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod code;
pub mod descriptor;
pub mod engine;
pub mod hook;
pub mod patcher;
pub mod verify;
#[cfg(feature = "watch")]
pub mod watch;

pub use code::{Architecture, CodeError, Host};
pub use descriptor::{
    DescriptorTable, Entity, EntityLayout, FieldLayout, Operation, OperationDescriptor, OperationKind, Overlay,
    ParamDescriptor, TypeDescriptor,
};
pub use engine::{EngineConfig, PatchCandidate, PatchEngine, PatchError, PatchState, Submission};
pub use hook::HookError;
pub use patcher::byte::BytePatcher;
pub use patcher::mem::{PermissionError, PermissionWrapper};
pub use patcher::{install, Patcher};
pub use verify::{verify, MatchedPair, VerifyError};
#[cfg(feature = "watch")]
pub use watch::{ModuleWatcher, PatchModule, WatchConfig, WatchError, WatchHandle};
