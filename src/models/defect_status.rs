//! Status bitmask shared by every defect kind.
//!
//! Bits are independent flags: a defect can be fixed and ignored at the same
//! time, or excluded by both a path rule and a checker rule. Only NEW and FIXED
//! are mutually exclusive on a current record.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Defect status flags as persisted in the `status` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefectStatus(i32);

impl DefectStatus {
    pub const NONE: Self = Self(0);
    pub const NEW: Self = Self(1);
    pub const FIXED: Self = Self(2);
    pub const IGNORE: Self = Self(4);
    pub const PATH_MASK: Self = Self(8);
    pub const CHECKER_MASK: Self = Self(16);

    /// Union of every bit this crate knows about.
    pub const KNOWN: Self = Self(1 | 2 | 4 | 8 | 16);

    /// Either exclusion bit.
    pub const ANY_MASK: Self = Self(8 | 16);

    const NAMED: [(Self, &'static str); 5] = [
        (Self::NEW, "NEW"),
        (Self::FIXED, "FIXED"),
        (Self::IGNORE, "IGNORE"),
        (Self::PATH_MASK, "PATH_MASK"),
        (Self::CHECKER_MASK, "CHECKER_MASK"),
    ];

    /// Wrap a raw stored value without any checking.
    pub const fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> i32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    /// Neither FIXED nor masked: the defect still counts against the task.
    pub fn is_active(self) -> bool {
        !self.intersects(Self::FIXED) && !self.intersects(Self::ANY_MASK)
    }

    pub fn is_masked(self) -> bool {
        self.intersects(Self::ANY_MASK)
    }

    /// Decode a stored value, keeping only the flags that can be trusted.
    ///
    /// Corrupt values never fail: the anomalies are returned next to the
    /// trusted flags so read paths can flag them.
    pub fn decode(self) -> DecodedStatus {
        let mut anomalies = Vec::new();

        if self.0 < 0 {
            anomalies.push(StatusAnomaly::Negative(self.0));
            return DecodedStatus {
                flags: Self::NONE,
                anomalies,
            };
        }

        let unknown = self.0 & !Self::KNOWN.0;
        if unknown != 0 {
            anomalies.push(StatusAnomaly::UnknownBits(unknown));
        }

        let mut flags = Self(self.0 & Self::KNOWN.0);
        if flags.contains(Self::NEW | Self::FIXED) {
            // FIXED carries a timestamp, NEW is the stale bit.
            anomalies.push(StatusAnomaly::NewAndFixed);
            flags.remove(Self::NEW);
        }

        DecodedStatus { flags, anomalies }
    }

    /// Names of the known flags that are set, in bit order.
    pub fn flag_names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for DefectStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DefectStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for DefectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names = self.flag_names();
        if names.is_empty() {
            write!(f, "0x{:x}", self.0)
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Something wrong with a stored status value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StatusAnomaly {
    /// Bits outside the known flag set.
    UnknownBits(i32),
    /// The stored value was negative; no flag can be trusted.
    Negative(i32),
    /// NEW and FIXED were both set.
    NewAndFixed,
}

/// Result of [`DefectStatus::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStatus {
    pub flags: DefectStatus,
    pub anomalies: Vec<StatusAnomaly>,
}

impl DecodedStatus {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}
