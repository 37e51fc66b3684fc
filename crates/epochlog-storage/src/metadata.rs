//! Per-log metadata records kept by each local log store

use epochlog_common::{Epoch, Error, Lsn, NodeIndex, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of per-log metadata a shard persists
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogMetadataType {
    TrimPoint,
    LastClean,
    LastReleased,
    Seal,
}

impl LogMetadataType {
    pub const ALL: [Self; 4] = [Self::TrimPoint, Self::LastClean, Self::LastReleased, Self::Seal];
}

impl fmt::Display for LogMetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrimPoint => write!(f, "TRIM_POINT"),
            Self::LastClean => write!(f, "LAST_CLEAN"),
            Self::LastReleased => write!(f, "LAST_RELEASED"),
            Self::Seal => write!(f, "SEAL"),
        }
    }
}

/// Highest epoch a shard refuses further writes for, and who sealed it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seal {
    pub epoch: Epoch,
    pub sealed_by: NodeIndex,
}

/// A decoded metadata value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogMetadata {
    TrimPoint(Lsn),
    LastClean(Epoch),
    LastReleased(Lsn),
    Seal(Seal),
}

impl LogMetadata {
    #[must_use]
    pub const fn metadata_type(&self) -> LogMetadataType {
        match self {
            Self::TrimPoint(_) => LogMetadataType::TrimPoint,
            Self::LastClean(_) => LogMetadataType::LastClean,
            Self::LastReleased(_) => LogMetadataType::LastReleased,
            Self::Seal(_) => LogMetadataType::Seal,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a value stored under `expected`
    pub fn decode(expected: LogMetadataType, bytes: &[u8]) -> Result<Self> {
        let value: Self =
            bincode::deserialize(bytes).map_err(|e| Error::malformed(e.to_string()))?;
        if value.metadata_type() != expected {
            return Err(Error::malformed(format!(
                "expected {expected} metadata, found {}",
                value.metadata_type()
            )));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_checks_type() {
        let value = LogMetadata::LastClean(Epoch::new(3));
        let bytes = value.encode().unwrap();
        assert_eq!(
            LogMetadata::decode(LogMetadataType::LastClean, &bytes).unwrap(),
            value
        );
        assert!(matches!(
            LogMetadata::decode(LogMetadataType::TrimPoint, &bytes),
            Err(Error::MalformedRecord(_))
        ));
        assert!(matches!(
            LogMetadata::decode(LogMetadataType::TrimPoint, &[0xff]),
            Err(Error::MalformedRecord(_))
        ));
    }
}
