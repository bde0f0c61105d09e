//! # Descriptor
//!
//! Build-time tables describing what can be redirected.
//!
//! Every patchable entity publishes a [`DescriptorTable`]: its [`EntityLayout`] and one
//! [`OperationDescriptor`] per operation. Patch entities publish the same kind of table, with each
//! intended replacement marked [`OperationKind::Override`]. Matching an original against a patch
//! is then a table lookup plus descriptor equality (see [`crate::verify`]).
//!
//! ```
//! use std::mem::offset_of;
//! use livepatch::{DescriptorTable, Entity, EntityLayout};
//!
//! #[repr(C)]
//! pub struct Counter {
//!     hits: u64,
//! }
//!
//! impl Counter {
//!     #[inline(never)]
//!     pub fn hits(&self) -> u64 {
//!         std::hint::black_box(self.hits)
//!     }
//! }
//!
//! unsafe impl Entity for Counter {
//!     fn layout() -> EntityLayout {
//!         EntityLayout::of::<Counter>().field::<u64>("hits", offset_of!(Counter, hits))
//!     }
//! }
//!
//! let table = DescriptorTable::of::<Counter>().define("hits", Counter::hits as fn(&Counter) -> u64);
//! assert_eq!(table.operations[0].to_string(), format!("fn hits(&{}) -> u64", std::any::type_name::<Counter>()));
//! ```

use std::any::{type_name, TypeId};
use std::borrow::Cow;
use std::fmt;
use std::mem::{align_of, size_of};

/// Identity of a value type: name, size and alignment. Two types are compatible only if all three match.
///
/// The name comes from [`std::any::type_name`], which is not guaranteed to be unique: two
/// distinct types, for instance from different versions of one crate, can report the same name.
/// Matching on name, size and alignment together is a best-effort check, not a proof of identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    /// Fully qualified type name
    pub name: Cow<'static, str>,
    /// Size in bytes
    pub size: usize,
    /// Alignment in bytes
    pub align: usize,
}

impl TypeDescriptor {
    /// Describes `T`
    pub fn of<T>() -> Self {
        Self {
            name: Cow::Borrowed(type_name::<T>()),
            size: size_of::<T>(),
            align: align_of::<T>(),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One parameter of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamDescriptor {
    /// The implicit reference to the entity the operation is called on
    Receiver {
        /// The entity behind the reference
        pointee: TypeDescriptor,
        /// Type of the entity's first field, if it has any
        first_field: Option<TypeDescriptor>,
    },
    /// Any other parameter, passed by value
    Value(TypeDescriptor),
}

impl ParamDescriptor {
    /// Describes a `&T` or `&mut T` receiver
    pub fn receiver<T: Entity>() -> Self {
        Self::Receiver {
            pointee: TypeDescriptor::of::<T>(),
            first_field: T::layout().fields.into_iter().next().map(|field| field.ty),
        }
    }

    /// Describes a by-value parameter of type `T`
    pub fn value<T>() -> Self {
        Self::Value(TypeDescriptor::of::<T>())
    }
}

impl fmt::Display for ParamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receiver { pointee, .. } => write!(f, "&{pointee}"),
            Self::Value(ty) => write!(f, "{ty}"),
        }
    }
}

/// How an operation relates to the entity that publishes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Defined by an original entity
    Defined,
    /// Explicitly marked by the patch author as the replacement for the original of the same name
    Override,
    /// Inherited unchanged from the embedded original; never redirected to
    Forwarded,
}

/// One patchable operation: name, signature and resolved entry address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    /// Stable name matched between original and patch
    pub name: Cow<'static, str>,
    /// Parameters in order; the receiver, if any, comes first
    pub params: Vec<ParamDescriptor>,
    /// Return types; empty for `()`
    pub returns: Vec<TypeDescriptor>,
    /// Address of the first instruction, `0` while unresolved
    pub entry: usize,
    /// Role of the operation in its table
    pub kind: OperationKind,
}

impl OperationDescriptor {
    /// Describes the function `f`
    pub fn new<F: Operation>(name: impl Into<Cow<'static, str>>, kind: OperationKind, f: F) -> Self {
        Self {
            name: name.into(),
            params: F::params(),
            returns: F::returns(),
            entry: f.entry(),
            kind,
        }
    }

    /// The receiver parameter, if this is a method
    pub fn receiver(&self) -> Option<&ParamDescriptor> {
        self.params
            .first()
            .filter(|param| matches!(param, ParamDescriptor::Receiver { .. }))
    }
}

impl fmt::Display for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(")")?;
        match self.returns.as_slice() {
            [] => Ok(()),
            [ty] => write!(f, " -> {ty}"),
            many => {
                f.write_str(" -> (")?;
                for (i, ty) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{ty}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A field of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    /// Field name
    pub name: Cow<'static, str>,
    /// Byte offset from the start of the entity
    pub offset: usize,
    /// Type of the field
    pub ty: TypeDescriptor,
    /// Full layout of the field when it is an embedded entity.
    ///
    /// This is the marker a patch entity uses to declare which original it overlays.
    pub embedded: Option<Box<EntityLayout>>,
}

/// Storage layout of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLayout {
    /// Key of the entity: its type name
    pub name: Cow<'static, str>,
    /// Total size in bytes
    pub size: usize,
    /// Alignment in bytes
    pub align: usize,
    /// Fields in declaration order
    pub fields: Vec<FieldLayout>,
}

impl EntityLayout {
    /// Starts the layout of `T`, keyed by its type name, with no fields
    pub fn of<T>() -> Self {
        Self {
            name: Cow::Borrowed(type_name::<T>()),
            size: size_of::<T>(),
            align: align_of::<T>(),
            fields: Vec::new(),
        }
    }

    /// Appends a plain field of type `F` at `offset`
    pub fn field<F>(mut self, name: impl Into<Cow<'static, str>>, offset: usize) -> Self {
        self.fields.push(FieldLayout {
            name: name.into(),
            offset,
            ty: TypeDescriptor::of::<F>(),
            embedded: None,
        });
        self
    }

    /// Appends a field holding the entity `E` at `offset`
    pub fn embed<E: Entity>(mut self, name: impl Into<Cow<'static, str>>, offset: usize) -> Self {
        self.fields.push(FieldLayout {
            name: name.into(),
            offset,
            ty: TypeDescriptor::of::<E>(),
            embedded: Some(Box::new(E::layout())),
        });
        self
    }

    /// Layout of the overlay `T`: a single field named `base` embedding `T::Base`
    pub fn overlay<T: Overlay>() -> Self {
        Self::of::<T>().embed::<T::Base>("base", T::base_offset())
    }

    /// The first declared field
    pub fn first_field(&self) -> Option<&FieldLayout> {
        self.fields.first()
    }
}

/// A type whose operations can be described and redirected.
///
/// # Safety
///
/// [`Entity::layout`] must describe the real size, alignment and field offsets of the type.
/// Redirected code reinterprets receivers based on this description.
pub unsafe trait Entity: Sized + 'static {
    /// Layout of the type
    fn layout() -> EntityLayout;
}

/// A patch entity that overlays `Base`: a pointer to it may be used wherever a pointer to `Base`
/// is expected.
///
/// # Safety
///
/// The type must be `#[repr(C)]` with `Base` as its first field, and must not be larger than
/// `Base`. [`crate::verify::verify`] re-checks both against the published layouts before anything
/// is redirected.
pub unsafe trait Overlay: Entity {
    /// The original entity being overlaid
    type Base: Entity;

    /// Byte offset of the `Base` field, `0` for a well formed overlay
    fn base_offset() -> usize;

    /// Key of the original entity
    fn base_key() -> Cow<'static, str> {
        Self::Base::layout().name
    }
}

/// Function pointer types that can be described as an operation
pub trait Operation: Copy {
    /// Parameter descriptors, receiver first
    fn params() -> Vec<ParamDescriptor>;
    /// Return descriptors, empty for `()`
    fn returns() -> Vec<TypeDescriptor>;
    /// Entry address
    fn entry(self) -> usize;
}

/// Return descriptors for `R`
fn returns_of<R: 'static>() -> Vec<TypeDescriptor> {
    if TypeId::of::<R>() == TypeId::of::<()>() {
        Vec::new()
    } else {
        vec![TypeDescriptor::of::<R>()]
    }
}

/// Implements [`Operation`] for methods taking `&S` or `&mut S` plus the given arguments
macro_rules! impl_operation {
    ($($arg:ident),*) => {
        impl<S: Entity, R: 'static $(, $arg: 'static)*> Operation for fn(&S $(, $arg)*) -> R {
            fn params() -> Vec<ParamDescriptor> {
                vec![ParamDescriptor::receiver::<S>() $(, ParamDescriptor::value::<$arg>())*]
            }
            fn returns() -> Vec<TypeDescriptor> {
                returns_of::<R>()
            }
            fn entry(self) -> usize {
                self as usize
            }
        }

        impl<S: Entity, R: 'static $(, $arg: 'static)*> Operation for fn(&mut S $(, $arg)*) -> R {
            fn params() -> Vec<ParamDescriptor> {
                vec![ParamDescriptor::receiver::<S>() $(, ParamDescriptor::value::<$arg>())*]
            }
            fn returns() -> Vec<TypeDescriptor> {
                returns_of::<R>()
            }
            fn entry(self) -> usize {
                self as usize
            }
        }
    };
}

impl_operation!();
impl_operation!(A1);
impl_operation!(A1, A2);
impl_operation!(A1, A2, A3);
impl_operation!(A1, A2, A3, A4);
impl_operation!(A1, A2, A3, A4, A5);
impl_operation!(A1, A2, A3, A4, A5, A6);

impl<R: 'static> Operation for fn() -> R {
    fn params() -> Vec<ParamDescriptor> {
        Vec::new()
    }
    fn returns() -> Vec<TypeDescriptor> {
        returns_of::<R>()
    }
    fn entry(self) -> usize {
        self as usize
    }
}

/// The descriptor table an entity publishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTable {
    /// Layout of the entity
    pub layout: EntityLayout,
    /// Operations in declaration order
    pub operations: Vec<OperationDescriptor>,
}

impl DescriptorTable {
    /// Creates an empty table for `layout`
    pub fn new(layout: EntityLayout) -> Self {
        Self {
            layout,
            operations: Vec::new(),
        }
    }

    /// Creates an empty table for `T`
    pub fn of<T: Entity>() -> Self {
        Self::new(T::layout())
    }

    /// Key of the entity
    pub fn key(&self) -> &str {
        &self.layout.name
    }

    /// Adds an already built descriptor
    pub fn with(mut self, operation: OperationDescriptor) -> Self {
        self.operations.push(operation);
        self
    }

    /// Adds an operation of an original entity
    pub fn define<F: Operation>(self, name: impl Into<Cow<'static, str>>, f: F) -> Self {
        self.with(OperationDescriptor::new(name, OperationKind::Defined, f))
    }

    /// Adds a replacement for the original operation of the same name
    pub fn overrides<F: Operation>(self, name: impl Into<Cow<'static, str>>, f: F) -> Self {
        self.with(OperationDescriptor::new(name, OperationKind::Override, f))
    }

    /// Adds an operation inherited unchanged from the embedded original
    pub fn forwards<F: Operation>(self, name: impl Into<Cow<'static, str>>, f: F) -> Self {
        self.with(OperationDescriptor::new(name, OperationKind::Forwarded, f))
    }

    /// Looks up an operation by name
    pub fn operation(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.iter().find(|op| op.name == name)
    }
}
