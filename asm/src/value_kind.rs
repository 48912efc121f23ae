//! Value-kind discriminants shared by `Cast`, `TestTag`, and foreign
//! parameter-kind declarations (§4.E, §4.H).

use strum::{Display, EnumIter};

/// A closed enumeration of the value tags a `Cast` or `TestTag` operand
/// can name, and the set of kinds a foreign function parameter/return can
/// declare.
///
/// Grounded on `fuel-asm::args`'s `enum_try_from!`-generated argument
/// lists (`GMArgs`, `GTFArgs`): a small, closed, numbered catalog with a
/// fallible `TryFrom<u8>`.
#[derive(Debug, Display, EnumIter, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ValueKind {
    /// §3.1 Nil.
    Nil = 0,
    /// §3.1 Bool.
    Bool = 1,
    /// §3.1 Char.
    Char = 2,
    /// §3.1 Int.
    Int = 3,
    /// §3.1 Float.
    Float = 4,
    /// §3.1 String.
    String = 5,
    /// §3.1 Array.
    Array = 6,
    /// §3.1 Table.
    Table = 7,
    /// §3.1 Option (Some/None).
    Option = 8,
    /// §3.1 Result (Ok/Err).
    Result = 9,
    /// §3.1 Ref(id).
    Ref = 10,
    /// §3.1 Weak(id).
    Weak = 11,
}

impl TryFrom<u8> for ValueKind {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use ValueKind::*;
        Ok(match byte {
            0 => Nil,
            1 => Bool,
            2 => Char,
            3 => Int,
            4 => Float,
            5 => String,
            6 => Array,
            7 => Table,
            8 => Option,
            9 => Result,
            10 => Ref,
            11 => Weak,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn every_kind_round_trips_through_its_byte() {
        for kind in ValueKind::iter() {
            assert_eq!(ValueKind::try_from(kind as u8), Ok(kind));
        }
    }

    #[test]
    fn unknown_byte_is_rejected() {
        assert_eq!(ValueKind::try_from(200), Err(200));
    }
}
