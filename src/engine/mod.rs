//! # Engine
//!
//! Orchestrates verification and redirection per entity.
//!
//! The [`PatchEngine`] owns a registry of original descriptor tables and of patch candidates that
//! arrived before their original, or before the caller reached a safe point to apply them. Each
//! entity has its own lock: different entities patch in parallel, applies to one entity serialise.
//!
//! ```no_run
//! use livepatch::{EngineConfig, PatchEngine};
//!
//! let engine = PatchEngine::new(EngineConfig::default());
//! engine.self_test().expect("function redirection does not work on this platform");
//! ```

use std::collections::HashMap;
use std::error::Error as StdError;
use std::hint::black_box;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::code::{Architecture, CodeError, Host};
use crate::descriptor::{DescriptorTable, Overlay};
use crate::hook::jmphook::JmpHook;
use crate::hook::{Hook, HookError};
use crate::patcher::byte::BytePatcher;
use crate::patcher::mem::PermissionWrapper;
use crate::patcher::Patcher;
use crate::verify::{verify, MatchedPair, VerifyError};


/// Errors while applying a patch
#[derive(Debug, Error)]
pub enum PatchError {
    /// The patch table was rejected; nothing was redirected
    #[error(transparent)]
    Verify(#[from] VerifyError),
    /// The candidate's version tag does not belong to the module that delivered it
    #[error("{entity}: version tag {found:?} does not match module version {expected}")]
    VersionMismatch {
        /// Key of the original entity
        entity: String,
        /// Version of the delivering module
        expected: String,
        /// Tag carried by the candidate
        found: Option<String>,
    },
    /// A patch operation resolves to the original it should replace
    #[error("{entity} method {operation}: patch and original are the same function at {address:#x}")]
    SameAddress {
        /// Key of the original entity
        entity: String,
        /// Operation name
        operation: String,
        /// Shared entry address
        address: usize,
    },
    /// No trampoline could be generated for a patch address
    #[error(transparent)]
    Code(#[from] CodeError),
    /// Writing a trampoline failed; the affected page may be left in an unknown state
    #[error("failed to redirect {entity} method {operation} at {address:#x}")]
    Install {
        /// Key of the original entity
        entity: String,
        /// Operation name
        operation: String,
        /// Entry address of the original
        address: usize,
        /// Underlying error
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    /// Redirecting a test function had no effect on this platform
    #[error("redirected functions still run their original body on this platform")]
    PlatformUnsupported,
}

impl PatchError {
    /// Whether the error leaves code or page protections in a state the process should not
    /// continue from
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Install { .. } | Self::SameAddress { .. })
    }
}

/// Behaviour of a [`PatchEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Abort the process when an installation fails
    pub abort_on_fault: bool,
    /// Apply a submitted candidate immediately when its original is registered
    pub apply_on_submit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            abort_on_fault: true,
            apply_on_submit: true,
        }
    }
}

impl EngineConfig {
    /// Sets [`EngineConfig::abort_on_fault`]
    pub fn with_abort_on_fault(mut self, abort_on_fault: bool) -> Self {
        self.abort_on_fault = abort_on_fault;
        self
    }

    /// Sets [`EngineConfig::apply_on_submit`]
    pub fn with_apply_on_submit(mut self, apply_on_submit: bool) -> Self {
        self.apply_on_submit = apply_on_submit;
        self
    }
}

/// Patch state of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchState {
    /// Every operation runs its original body
    #[default]
    Unpatched,
    /// At least one patch was applied
    Patched {
        /// Number of patches applied so far
        generation: u32,
    },
}

/// A patch table offered for an original entity
#[derive(Debug, Clone)]
pub struct PatchCandidate {
    /// Key of the original entity
    pub entity: String,
    /// Version of the module that delivered the candidate
    pub module_version: String,
    /// Version tag the patch author attached to the candidate
    pub version: Option<String>,
    /// Descriptor table of the patch entity
    pub table: DescriptorTable,
}

impl PatchCandidate {
    /// Creates an untagged candidate for the original keyed `entity`
    pub fn new(entity: impl Into<String>, table: DescriptorTable) -> Self {
        Self {
            entity: entity.into(),
            module_version: String::new(),
            version: None,
            table,
        }
    }

    /// Creates an untagged candidate for the original `T` overlays
    pub fn overlay<T: Overlay>(table: DescriptorTable) -> Self {
        Self::new(T::base_key(), table)
    }

    /// Attaches the author's version tag
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the version of the delivering module
    pub fn with_module_version(mut self, module_version: impl Into<String>) -> Self {
        self.module_version = module_version.into();
        self
    }

    /// Fails unless the version tag equals the module version
    fn check_version(&self) -> Result<(), PatchError> {
        if self.version.as_deref() != Some(self.module_version.as_str()) {
            return Err(PatchError::VersionMismatch {
                entity: self.entity.clone(),
                expected: self.module_version.clone(),
                found: self.version.clone(),
            });
        }
        Ok(())
    }
}

/// Outcome of [`PatchEngine::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The candidate was applied, redirecting this many operations
    Applied(usize),
    /// The candidate is waiting for its original or for [`PatchEngine::apply_pending`]
    Pending,
}

/// Registry entry of one entity
#[derive(Default)]
struct EntitySlot {
    /// Descriptor table of the original, once registered
    original: Option<DescriptorTable>,
    /// Latest candidate not yet applied
    pending: Option<PatchCandidate>,
    /// Current state
    state: PatchState,
}

/// Verifies patches and redirects original operations to them
pub struct PatchEngine<P = PermissionWrapper<BytePatcher>, A = Host> {
    /// Behaviour switches
    config: EngineConfig,
    /// Writes one trampoline per matched pair
    hook: JmpHook<P, A>,
    /// Per-entity state keyed by entity key
    entities: RwLock<HashMap<String, Arc<Mutex<EntitySlot>>>>,
}

impl PatchEngine {
    /// Creates an engine that writes live code of the host architecture
    pub fn new(config: EngineConfig) -> Self {
        Self::with_patcher(config, PermissionWrapper::new(BytePatcher::new()))
    }
}

impl<P, A> PatchEngine<P, A>
where
    P: Patcher,
    P::Error: StdError + Send + Sync + 'static,
    A: Architecture,
{
    /// Creates an engine writing through `patcher`
    pub fn with_patcher(config: EngineConfig, patcher: P) -> Self {
        Self {
            config,
            hook: JmpHook::new(patcher),
            entities: RwLock::new(HashMap::new()),
        }
    }

    /// The engine's configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The patcher trampolines are written through
    pub fn patcher(&self) -> &P {
        self.hook.patcher()
    }

    /// Verifies `patch` against `original` and redirects every matched operation.
    ///
    /// Returns the number of redirected operations; zero is a valid outcome. Nothing is written
    /// unless verification of the whole table succeeds.
    ///
    /// # Safety
    ///
    /// - every entry address in both tables must be the first instruction of a function with the
    ///   described signature, and every original must be at least [`Architecture::TRAMPOLINE_LEN`]
    ///   bytes long
    /// - no other thread may apply to the same entity or execute the entry of a matched original
    ///   while it is overwritten
    pub unsafe fn apply(&self, original: &DescriptorTable, patch: &DescriptorTable) -> Result<usize, PatchError> {
        let entity = original.key();
        log::info!("apply patching to {entity}");

        let pairs = verify(original, patch)?;
        if let Some(pair) = pairs.iter().find(|pair| pair.original == pair.patch) {
            return Err(self.fault(PatchError::SameAddress {
                entity: entity.to_string(),
                operation: pair.name.to_string(),
                address: pair.original,
            }));
        }

        for pair in &pairs {
            self.redirect(entity, pair)?;
        }

        log::info!("patched {} method(s) of {entity}", pairs.len());
        Ok(pairs.len())
    }

    /// Writes the trampoline for one verified pair
    unsafe fn redirect(&self, entity: &str, pair: &MatchedPair) -> Result<(), PatchError> {
        match self.hook.hook(pair.original as *const u8, pair.patch as *const u8) {
            Ok(()) => {
                log::debug!(
                    "redirected {entity}::{} {:#x} -> {:#x}",
                    pair.name,
                    pair.original,
                    pair.patch
                );
                Ok(())
            }
            Err(HookError::Code(e)) => Err(PatchError::Code(e)),
            Err(HookError::SameAddress(address)) => Err(self.fault(PatchError::SameAddress {
                entity: entity.to_string(),
                operation: pair.name.to_string(),
                address,
            })),
            Err(HookError::Patch(e)) => Err(self.fault(PatchError::Install {
                entity: entity.to_string(),
                operation: pair.name.to_string(),
                address: pair.original,
                source: Box::new(e),
            })),
        }
    }

    /// Applies the fault policy to a fatal error and hands it back when the process survives
    fn fault(&self, error: PatchError) -> PatchError {
        if self.config.abort_on_fault {
            log::error!("{error}; aborting");
            std::process::abort();
        }
        log::error!("{error}");
        error
    }

    /// Registry entry for `key`, created on first use
    fn slot(&self, key: &str) -> Arc<Mutex<EntitySlot>> {
        if let Some(slot) = self.entities.read().get(key) {
            return Arc::clone(slot);
        }
        Arc::clone(self.entities.write().entry(key.to_string()).or_default())
    }

    /// Registers the descriptor table of an original entity and applies a candidate already
    /// waiting for it.
    ///
    /// Returns the number of operations redirected by that candidate.
    ///
    /// # Safety
    ///
    /// Same as [`PatchEngine::apply`], for the table and any pending candidate.
    pub unsafe fn register(&self, table: DescriptorTable) -> Result<usize, PatchError> {
        log::debug!("registered {}", table.key());
        let slot = self.slot(table.key());
        let mut slot = slot.lock();
        slot.original = Some(table);
        self.apply_slot(&mut slot)
    }

    /// Offers a patch candidate.
    ///
    /// The version tag is checked first. The candidate is then applied right away when its
    /// original is registered and [`EngineConfig::apply_on_submit`] is set; otherwise it waits,
    /// replacing any older candidate for the same entity.
    ///
    /// # Safety
    ///
    /// Same as [`PatchEngine::apply`], for the candidate and its registered original.
    pub unsafe fn submit(&self, candidate: PatchCandidate) -> Result<Submission, PatchError> {
        candidate.check_version()?;
        log::info!("patch detected: {}", candidate.entity);

        let slot = self.slot(&candidate.entity);
        let mut slot = slot.lock();
        if let Some(old) = slot.pending.replace(candidate) {
            log::debug!("dropped older pending patch for {}", old.entity);
        }

        if self.config.apply_on_submit && slot.original.is_some() {
            self.apply_slot(&mut slot).map(Submission::Applied)
        } else {
            Ok(Submission::Pending)
        }
    }

    /// Applies the pending candidate of `key`, if both it and its original are present.
    ///
    /// Returns the number of redirected operations.
    ///
    /// # Safety
    ///
    /// Same as [`PatchEngine::apply`]. This is the call to make at a point where no thread runs
    /// the entity's operations.
    pub unsafe fn apply_pending(&self, key: &str) -> Result<usize, PatchError> {
        let slot = self.slot(key);
        let mut slot = slot.lock();
        self.apply_slot(&mut slot)
    }

    /// Applies and discards the pending candidate of a locked slot
    unsafe fn apply_slot(&self, slot: &mut EntitySlot) -> Result<usize, PatchError> {
        let Some(original) = slot.original.as_ref() else {
            return Ok(0);
        };
        let Some(candidate) = slot.pending.take() else {
            return Ok(0);
        };

        let count = self.apply(original, &candidate.table)?;
        if count > 0 {
            slot.state = match slot.state {
                PatchState::Unpatched => PatchState::Patched { generation: 1 },
                PatchState::Patched { generation } => PatchState::Patched {
                    generation: generation + 1,
                },
            };
        }
        Ok(count)
    }

    /// Current state of the entity keyed `key`
    pub fn state(&self, key: &str) -> PatchState {
        self.entities
            .read()
            .get(key)
            .map(|slot| slot.lock().state)
            .unwrap_or_default()
    }

    /// Whether a candidate for `key` is waiting to be applied
    pub fn pending(&self, key: &str) -> bool {
        self.entities
            .read()
            .get(key)
            .is_some_and(|slot| slot.lock().pending.is_some())
    }

    /// Whether an original is registered under `key`
    pub fn is_registered(&self, key: &str) -> bool {
        self.entities
            .read()
            .get(key)
            .is_some_and(|slot| slot.lock().original.is_some())
    }

    /// Redirects a private test function and checks that calls reach the replacement.
    ///
    /// Fails with [`PatchError::PlatformUnsupported`] when the redirect is silently ineffective.
    pub fn self_test(&self) -> Result<(), PatchError> {
        // Safety: both functions are private, non-inlined and longer than any trampoline
        unsafe { self.check_redirect(self_test_original, self_test_replacement)? };
        log::debug!("self test passed");
        Ok(())
    }

    /// Redirects `original` to `replacement`, then checks the trampoline bytes at the entry of
    /// `original` and the value a call returns.
    ///
    /// # Safety
    /// Both functions must be non-inlined, at least [`Architecture::TRAMPOLINE_LEN`] bytes long
    /// and called by nothing else while the redirect is written.
    unsafe fn check_redirect(&self, original: fn() -> u32, replacement: fn() -> u32) -> Result<(), PatchError> {
        let entry = original as usize;
        let target = replacement as usize;
        self.redirect("self test", &self_test_pair(entry, target))?;

        let expected = A::jmp_abs(target as u64)?;
        let written = std::slice::from_raw_parts(entry as *const u8, expected.len());
        if written != expected.as_slice() {
            log::error!("self test failed: no trampoline at {entry:#x}");
            return Err(PatchError::PlatformUnsupported);
        }

        let result = black_box(original)();
        if result != black_box(replacement)() {
            log::error!("self test failed: redirected call returned {result}");
            return Err(PatchError::PlatformUnsupported);
        }
        Ok(())
    }
}

/// Pair used by [`PatchEngine::self_test`]
fn self_test_pair(original: usize, patch: usize) -> MatchedPair {
    MatchedPair {
        name: "self_test".into(),
        original,
        patch,
    }
}

/// Redirected by the self test
#[inline(never)]
fn self_test_original() -> u32 {
    black_box(black_box(1u32).wrapping_mul(black_box(3)).wrapping_add(black_box(0x100)))
}

/// Replacement for [`self_test_original`]
#[inline(never)]
fn self_test_replacement() -> u32 {
    black_box(black_box(2u32).wrapping_mul(black_box(5)).wrapping_add(black_box(0x200)))
}
