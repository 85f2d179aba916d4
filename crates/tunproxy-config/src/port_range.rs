use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::ConfigError;

/// Inclusive port range parsed from `low-high`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Result<Self, ConfigError> {
        if low == 0 || low >= high {
            return Err(ConfigError::InvalidPortRange(format!("{}-{}", low, high)));
        }
        Ok(Self { low, high })
    }

    pub fn as_range(&self) -> RangeInclusive<u16> {
        self.low..=self.high
    }

    pub fn len(&self) -> usize {
        (self.high - self.low) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.low > self.high
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            low: 10000,
            high: 60000,
        }
    }
}

impl FromStr for PortRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPortRange(s.to_string());

        let (low, high) = s.trim().split_once('-').ok_or_else(invalid)?;
        let low: u16 = low.trim().parse().map_err(|_| invalid())?;
        let high: u16 = high.trim().parse().map_err(|_| invalid())?;

        Self::new(low, high).map_err(|_| invalid())
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        let range: PortRange = "10000-60000".parse().unwrap();
        assert_eq!(range, PortRange::default());
        assert_eq!(range.len(), 50001);
        assert!(range.as_range().contains(&10000));
        assert!(range.as_range().contains(&60000));
    }

    #[test]
    fn test_parse_with_spaces() {
        let range: PortRange = " 20000 - 20010 ".parse().unwrap();
        assert_eq!(range.low, 20000);
        assert_eq!(range.high, 20010);
        assert_eq!(range.to_string(), "20000-20010");
    }

    #[test]
    fn test_reject_invalid_ranges() {
        for input in ["", "10000", "60000-10000", "5-5", "0-100", "a-b", "1-70000"] {
            assert!(
                matches!(input.parse::<PortRange>(), Err(ConfigError::InvalidPortRange(_))),
                "accepted {:?}",
                input
            );
        }
    }
}
