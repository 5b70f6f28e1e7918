use lasso::{Spur, ThreadedRodeo};
use std::num::NonZeroU32;

/// Interned UTF-8 string. All class, field, method and descriptor names are
/// interned once and compared by key afterwards.
pub type Symbol = Spur;

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU32);

        impl $name {
            pub fn new(raw: NonZeroU32) -> Self {
                Self(raw)
            }

            /// Builds an id from a 1-based position, usually the length of the
            /// owning table right after a push.
            pub fn from_usize(pos: usize) -> Self {
                Self(NonZeroU32::new(pos as u32).expect("id positions are 1-based"))
            }

            pub fn to_index(self) -> usize {
                (self.0.get() - 1) as usize
            }

            pub fn into_inner(self) -> NonZeroU32 {
                self.0
            }

            pub fn from_raw(raw: u32) -> Option<Self> {
                NonZeroU32::new(raw).map(Self)
            }

            pub fn as_raw(self) -> u32 {
                self.0.get()
            }
        }
    };
}

typed_id!(
    /// Stable index in the grow-only class table.
    ClassId
);
typed_id!(
    /// Identifies a registered VM thread.
    ThreadId
);

/// Identifies a method as (owning class, position in the class' method
/// directory). Constant-pool resolution caches these in a single payload
/// word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub class: ClassId,
    pub index: u16,
}

impl MethodId {
    pub fn new(class: ClassId, index: u16) -> Self {
        Self { class, index }
    }

    pub fn pack(self) -> u64 {
        ((self.class.as_raw() as u64) << 16) | self.index as u64
    }

    pub fn unpack(word: u64) -> Option<Self> {
        let class = ClassId::from_raw((word >> 16) as u32)?;
        Some(Self {
            class,
            index: (word & 0xffff) as u16,
        })
    }
}

/// Identifies a field the same way methods are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId {
    pub class: ClassId,
    pub index: u16,
}

impl FieldId {
    pub fn new(class: ClassId, index: u16) -> Self {
        Self { class, index }
    }

    pub fn pack(self) -> u64 {
        ((self.class.as_raw() as u64) << 16) | self.index as u64
    }

    pub fn unpack(word: u64) -> Option<Self> {
        let class = ClassId::from_raw((word >> 16) as u32)?;
        Some(Self {
            class,
            index: (word & 0xffff) as u16,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub name: Symbol,
    pub desc: Symbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub name: Symbol,
    pub desc: Symbol,
}

/// Key of a native method body: (class internal name, method name,
/// descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullyQualifiedMethodKey {
    pub class: Symbol,
    pub name: Symbol,
    pub desc: Symbol,
}

impl FullyQualifiedMethodKey {
    pub fn new(class: Symbol, name: Symbol, desc: Symbol) -> Self {
        Self { class, name, desc }
    }

    pub fn new_with_str(class: &str, name: &str, desc: &str, interner: &ThreadedRodeo) -> Self {
        Self {
            class: interner.get_or_intern(class),
            name: interner.get_or_intern(name),
            desc: interner.get_or_intern(desc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_positions() {
        let id = ClassId::from_usize(42);
        assert_eq!(id.to_index(), 41);
        assert_eq!(id.as_raw(), 42);
    }

    #[test]
    fn method_id_packs_into_one_word() {
        let id = MethodId::new(ClassId::from_usize(7), 513);
        assert_eq!(MethodId::unpack(id.pack()), Some(id));
    }
}
