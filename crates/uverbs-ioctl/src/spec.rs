//! Attribute specifications.
//!
//! An [`AttrSpec`] describes one attribute a method accepts: what kind of value it carries and
//! the constraints the parser enforces on it. The `const` constructors reject inconsistent specs
//! with a panic, which turns into a compile error when the spec is declared in a `const` or
//! `static`.

use std::borrow::Cow;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct AttrSpecFlags: u8 {
        /// The request is rejected if the attribute is absent.
        const MANDATORY = 1 << 0;
        /// The sender may supply more bytes than `len`; the excess must read as zero.
        const MIN_SZ_OR_ZERO = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct MethodFlags: u32 {
        /// The method creates the root context instead of running inside one.
        const CREATE_ROOT = 1 << 0;
    }
}

/// How a method uses the object an attribute refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    /// Allocates a new object; the wire id is ignored and the new id is written back.
    Create,
    Destroy,
}

/// Which handle namespace an object lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectClass {
    /// Small integer handles allocated per context.
    Idr,
    /// File-descriptor backed objects.
    Fd,
}

/// Size constraints of a pointer attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PtrSpec {
    /// Size known to this side of the interface.
    pub len: u16,
    /// The sender may not provide fewer bytes than this.
    pub min_len: u16,
}

/// Object referenced by an object attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRefSpec {
    /// Id of the object (in the spec tree) that describes the referenced type.
    pub obj_type: u16,
    pub access: AccessMode,
}

/// Candidates an enum attribute selects between. Only input pointers are allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumSpec {
    pub ids: Cow<'static, [AttrSpec]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrKind {
    PtrIn(PtrSpec),
    PtrOut(PtrSpec),
    Idr(ObjectRefSpec),
    Fd(ObjectRefSpec),
    EnumIn(EnumSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrSpec {
    pub flags: AttrSpecFlags,
    pub kind: AttrKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("min_len {min_len} exceeds len {len}")]
    MinLenExceedsLen { min_len: u16, len: u16 },

    #[error("enum candidate {index} is not an input pointer")]
    EnumCandidateNotPointer { index: usize },

    #[error("enum attribute has no candidates")]
    EmptyEnum,

    #[error("enum attribute has {count} candidates (max 256)")]
    TooManyCandidates { count: usize },

    #[error("fd attributes only support read or create access")]
    FdAccess,
}

impl AttrSpec {
    /// Input pointer of exactly `len` bytes.
    pub const fn ptr_in(len: u16) -> Self {
        Self::ptr_in_sz(len, len)
    }

    /// Input pointer of `min_len..=len` bytes.
    pub const fn ptr_in_sz(min_len: u16, len: u16) -> Self {
        assert!(min_len <= len, "ptr attribute min_len exceeds len");
        Self {
            flags: AttrSpecFlags::empty(),
            kind: AttrKind::PtrIn(PtrSpec { len, min_len }),
        }
    }

    /// Output pointer of exactly `len` bytes.
    pub const fn ptr_out(len: u16) -> Self {
        Self::ptr_out_sz(len, len)
    }

    pub const fn ptr_out_sz(min_len: u16, len: u16) -> Self {
        assert!(min_len <= len, "ptr attribute min_len exceeds len");
        Self {
            flags: AttrSpecFlags::empty(),
            kind: AttrKind::PtrOut(PtrSpec { len, min_len }),
        }
    }

    pub const fn idr(obj_type: u16, access: AccessMode) -> Self {
        Self {
            flags: AttrSpecFlags::empty(),
            kind: AttrKind::Idr(ObjectRefSpec { obj_type, access }),
        }
    }

    pub const fn fd(obj_type: u16, access: AccessMode) -> Self {
        assert!(
            matches!(access, AccessMode::Read | AccessMode::Create),
            "fd attributes only support read or create access"
        );
        Self {
            flags: AttrSpecFlags::empty(),
            kind: AttrKind::Fd(ObjectRefSpec { obj_type, access }),
        }
    }

    /// Enum attribute over a static candidate list.
    pub const fn enum_in(ids: &'static [AttrSpec]) -> Self {
        assert!(!ids.is_empty(), "enum attribute has no candidates");
        assert!(ids.len() <= 256, "enum attribute has more than 256 candidates");
        let mut i = 0;
        while i < ids.len() {
            assert!(
                matches!(ids[i].kind, AttrKind::PtrIn(_)),
                "enum candidates must be input pointers"
            );
            i += 1;
        }
        Self {
            flags: AttrSpecFlags::empty(),
            kind: AttrKind::EnumIn(EnumSpec {
                ids: Cow::Borrowed(ids),
            }),
        }
    }

    /// Enum attribute over a candidate list built at runtime.
    pub fn enum_in_owned(ids: Vec<AttrSpec>) -> Result<Self, DefinitionError> {
        let spec = Self {
            flags: AttrSpecFlags::empty(),
            kind: AttrKind::EnumIn(EnumSpec {
                ids: Cow::Owned(ids),
            }),
        };
        spec.validate()?;
        Ok(spec)
    }

    pub const fn mandatory(mut self) -> Self {
        self.flags = self.flags.union(AttrSpecFlags::MANDATORY);
        self
    }

    pub const fn min_sz_or_zero(mut self) -> Self {
        self.flags = self.flags.union(AttrSpecFlags::MIN_SZ_OR_ZERO);
        self
    }

    pub const fn is_mandatory(&self) -> bool {
        self.flags.contains(AttrSpecFlags::MANDATORY)
    }

    /// Checks the invariants the `const` constructors assert. Specs built as struct literals
    /// only get this check at merge time.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        match &self.kind {
            AttrKind::PtrIn(ptr) | AttrKind::PtrOut(ptr) => ptr.validate(),
            AttrKind::Idr(_) => Ok(()),
            AttrKind::Fd(obj) => match obj.access {
                AccessMode::Read | AccessMode::Create => Ok(()),
                AccessMode::Write | AccessMode::Destroy => Err(DefinitionError::FdAccess),
            },
            AttrKind::EnumIn(spec) => {
                if spec.ids.is_empty() {
                    return Err(DefinitionError::EmptyEnum);
                }
                if spec.ids.len() > 256 {
                    return Err(DefinitionError::TooManyCandidates {
                        count: spec.ids.len(),
                    });
                }
                for (index, candidate) in spec.ids.iter().enumerate() {
                    match &candidate.kind {
                        AttrKind::PtrIn(ptr) => ptr.validate()?,
                        _ => return Err(DefinitionError::EnumCandidateNotPointer { index }),
                    }
                }
                Ok(())
            }
        }
    }
}

impl PtrSpec {
    fn validate(&self) -> Result<(), DefinitionError> {
        if self.min_len > self.len {
            return Err(DefinitionError::MinLenExceedsLen {
                min_len: self.min_len,
                len: self.len,
            });
        }
        Ok(())
    }
}

/// Type descriptor for objects of one kind.
///
/// Carried opaquely by the spec tree and handed to the object registry when an attribute
/// references an object of this type. Later definition trees may replace it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectType {
    pub name: &'static str,
    pub class: ObjectClass,
    /// Objects with a lower order are torn down first when a context goes away.
    pub destroy_order: u32,
}

impl ObjectType {
    pub const fn idr(name: &'static str) -> Self {
        Self {
            name,
            class: ObjectClass::Idr,
            destroy_order: 0,
        }
    }

    pub const fn fd(name: &'static str) -> Self {
        Self {
            name,
            class: ObjectClass::Fd,
            destroy_order: 0,
        }
    }

    pub const fn with_destroy_order(mut self, order: u32) -> Self {
        self.destroy_order = order;
        self
    }
}
