//! # Verify
//!
//! Decides whether a patch table may replace an original table, and which operations pair up.
//!
//! Verification never touches code. It is a pure function of the two tables, so it can be run
//! ahead of time and repeated at no risk.

use std::borrow::Cow;

use thiserror::Error;

use crate::descriptor::{
    DescriptorTable, EntityLayout, OperationDescriptor, OperationKind, ParamDescriptor, TypeDescriptor,
};

/// Errors rejecting a patch table. Nothing is redirected when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The patch entity cannot be reinterpreted as the original
    #[error("{entity}: {reason}")]
    LayoutMismatch {
        /// Key of the original entity
        entity: String,
        /// What did not match
        reason: String,
    },
    /// An override does not have exactly the original's signature
    #[error("{entity} method {operation}, {reason}, orig: {original}, patch: {patch}")]
    SignatureMismatch {
        /// Key of the original entity
        entity: String,
        /// Operation name
        operation: String,
        /// What did not match
        reason: String,
        /// Rendered signature of the original
        original: String,
        /// Rendered signature of the override
        patch: String,
    },
    /// An operation taking part in a redirection has no entry address
    #[error("{entity} method {operation} has no resolved entry address")]
    Unresolved {
        /// Key of the original entity
        entity: String,
        /// Operation name
        operation: String,
    },
    /// Two original operations share one body; redirecting one would silently redirect both
    #[error("{entity} methods {first} and {second} share the entry address {address:#x}")]
    AliasedOperation {
        /// Key of the original entity
        entity: String,
        /// Operation matched first
        first: String,
        /// Operation matched second
        second: String,
        /// Shared entry address
        address: usize,
    },
}

/// An original operation together with the override that replaces it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedPair {
    /// Operation name
    pub name: Cow<'static, str>,
    /// Entry address of the original
    pub original: usize,
    /// Entry address of the override
    pub patch: usize,
}

/// Checks `patch` against `original` and returns every operation to redirect.
///
/// The layouts are checked first, so an incompatible patch entity is rejected even when it
/// overrides nothing. Operations the patch only forwards are never paired.
pub fn verify(original: &DescriptorTable, patch: &DescriptorTable) -> Result<Vec<MatchedPair>, VerifyError> {
    let entity = original.key();
    check_layout(&original.layout, &patch.layout).map_err(|reason| VerifyError::LayoutMismatch {
        entity: entity.to_string(),
        reason,
    })?;

    let mut pairs: Vec<MatchedPair> = Vec::new();
    for orig in &original.operations {
        let Some(new) = patch
            .operations
            .iter()
            .find(|op| op.kind == OperationKind::Override && op.name == orig.name)
        else {
            continue;
        };

        check_signature(orig, new, &original.layout, &patch.layout).map_err(|reason| VerifyError::SignatureMismatch {
            entity: entity.to_string(),
            operation: orig.name.to_string(),
            reason,
            original: orig.to_string(),
            patch: new.to_string(),
        })?;

        if orig.entry == 0 || new.entry == 0 {
            return Err(VerifyError::Unresolved {
                entity: entity.to_string(),
                operation: orig.name.to_string(),
            });
        }

        if let Some(other) = pairs.iter().find(|pair| pair.original == orig.entry) {
            return Err(VerifyError::AliasedOperation {
                entity: entity.to_string(),
                first: other.name.to_string(),
                second: orig.name.to_string(),
                address: orig.entry,
            });
        }

        pairs.push(MatchedPair {
            name: orig.name.clone(),
            original: orig.entry,
            patch: new.entry,
        });
    }

    Ok(pairs)
}

/// The patch must be exactly the original, embedded as its first field
fn check_layout(original: &EntityLayout, patch: &EntityLayout) -> Result<(), String> {
    let embeds_original = patch
        .first_field()
        .filter(|field| field.offset == 0)
        .and_then(|field| field.embedded.as_deref())
        == Some(original);
    if !embeds_original {
        return Err(format!(
            "patch type must embed orig type as first elem, orig: {}, patch: {}",
            original.name, patch.name
        ));
    }

    if patch.size != original.size || patch.align != original.align {
        return Err(format!(
            "patch type must not have extra fields, orig size: {}, patch size: {}",
            original.size, patch.size
        ));
    }

    Ok(())
}

/// Whether `ty` is the entity described by `layout`
fn is_entity(ty: &TypeDescriptor, layout: &EntityLayout) -> bool {
    ty.name == layout.name && ty.size == layout.size && ty.align == layout.align
}

/// Parameter and return lists must match position by position.
///
/// Receivers must be the entities of their own tables, and the patch receiver must embed the
/// original receiver first.
fn check_signature(
    original: &OperationDescriptor,
    patch: &OperationDescriptor,
    original_layout: &EntityLayout,
    patch_layout: &EntityLayout,
) -> Result<(), String> {
    if original.params.len() != patch.params.len() {
        return Err("input param count mismatch".to_string());
    }
    if original.returns.len() != patch.returns.len() {
        return Err("output param count mismatch".to_string());
    }

    for (i, (orig, new)) in original.params.iter().zip(&patch.params).enumerate() {
        match (orig, new) {
            (
                ParamDescriptor::Receiver { pointee, .. },
                ParamDescriptor::Receiver {
                    pointee: patch_pointee,
                    first_field,
                },
            ) => {
                if !is_entity(pointee, original_layout)
                    || !is_entity(patch_pointee, patch_layout)
                    || first_field.as_ref() != Some(pointee)
                {
                    return Err("receiver not compatible".to_string());
                }
            }
            (ParamDescriptor::Value(a), ParamDescriptor::Value(b)) => {
                if a != b {
                    return Err(format!("input param {i} type mismatch"));
                }
            }
            _ => return Err(format!("input param {i} kind mismatch")),
        }
    }

    for (i, (a, b)) in original.returns.iter().zip(&patch.returns).enumerate() {
        if a != b {
            return Err(format!("output param {i} type mismatch"));
        }
    }

    Ok(())
}
