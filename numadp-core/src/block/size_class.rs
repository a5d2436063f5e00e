use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::AllocError;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;
const GIB: usize = 1024 * MIB;

/// Fixed block sizes served by the block allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    /// 4 KiB
    Small,
    /// 8 KiB
    Medium,
    /// 1 GiB
    Large,
}

impl SizeClass {
    pub const ALL: [SizeClass; 3] = [SizeClass::Small, SizeClass::Medium, SizeClass::Large];
    pub const COUNT: usize = Self::ALL.len();

    #[inline]
    pub const fn size(self) -> usize {
        match self {
            SizeClass::Small => 4 * KIB,
            SizeClass::Medium => 8 * KIB,
            SizeClass::Large => GIB,
        }
    }

    /// Alignment of every block of this class. Large blocks sit on huge-page
    /// boundaries so the kernel can back them with 2 MiB pages.
    #[inline]
    pub const fn align(self) -> usize {
        match self {
            SizeClass::Small => 4 * KIB,
            SizeClass::Medium => 8 * KIB,
            SizeClass::Large => 2 * MIB,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
        }
    }

    /// Smallest class whose blocks can hold `bytes`.
    pub fn for_size(bytes: usize) -> Result<SizeClass, AllocError> {
        if bytes == 0 {
            return Err(AllocError::ZeroSize);
        }
        Self::ALL
            .into_iter()
            .find(|class| bytes <= class.size())
            .ok_or(AllocError::NoFittingClass(bytes))
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizeClass {
    type Err = AllocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(SizeClass::Small),
            "medium" => Ok(SizeClass::Medium),
            "large" => Ok(SizeClass::Large),
            _ => Err(AllocError::InvalidSizeClass(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_geometry() {
        assert_eq!(SizeClass::Small.size(), 4096);
        assert_eq!(SizeClass::Medium.size(), 8192);
        assert_eq!(SizeClass::Large.size(), 1 << 30);
        for class in SizeClass::ALL {
            assert!(class.align().is_power_of_two());
            assert_eq!(class.size() % class.align(), 0);
        }
        assert_eq!(SizeClass::Large.index(), SizeClass::COUNT - 1);
    }

    #[test]
    fn test_for_size_picks_smallest_fit() {
        assert_eq!(SizeClass::for_size(1).unwrap(), SizeClass::Small);
        assert_eq!(SizeClass::for_size(4096).unwrap(), SizeClass::Small);
        assert_eq!(SizeClass::for_size(4097).unwrap(), SizeClass::Medium);
        assert_eq!(SizeClass::for_size(8193).unwrap(), SizeClass::Large);
        assert!(matches!(SizeClass::for_size(0), Err(AllocError::ZeroSize)));
        assert!(matches!(
            SizeClass::for_size((1 << 30) + 1),
            Err(AllocError::NoFittingClass(_))
        ));
    }

    #[test]
    fn test_parse() {
        assert_eq!("Small".parse::<SizeClass>().unwrap(), SizeClass::Small);
        assert_eq!("large".parse::<SizeClass>().unwrap(), SizeClass::Large);
        assert!(matches!(
            "huge".parse::<SizeClass>(),
            Err(AllocError::InvalidSizeClass(s)) if s == "huge"
        ));
        assert_eq!(SizeClass::Medium.to_string(), "medium");
    }
}
