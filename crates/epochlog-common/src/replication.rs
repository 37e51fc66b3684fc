//! Replication policy and failure-domain locations

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Failure-domain hierarchy, smallest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationScope {
    Node,
    Rack,
    Datacenter,
    Region,
}

impl LocationScope {
    pub const ALL: [Self; 4] = [Self::Node, Self::Rack, Self::Datacenter, Self::Region];
}

impl fmt::Display for LocationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "NODE"),
            Self::Rack => write!(f, "RACK"),
            Self::Datacenter => write!(f, "DATACENTER"),
            Self::Region => write!(f, "REGION"),
        }
    }
}

/// Where a node sits in the failure-domain hierarchy
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeLocation {
    pub region: String,
    pub datacenter: String,
    pub rack: String,
}

impl NodeLocation {
    #[must_use]
    pub fn new(
        region: impl Into<String>,
        datacenter: impl Into<String>,
        rack: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            datacenter: datacenter.into(),
            rack: rack.into(),
        }
    }

    /// Domain label at the given scope. Labels are prefixed by their parents
    /// so equally named racks in different datacenters stay distinct.
    ///
    /// Returns `None` for [`LocationScope::Node`], whose domain is the node
    /// itself.
    #[must_use]
    pub fn domain(&self, scope: LocationScope) -> Option<String> {
        match scope {
            LocationScope::Node => None,
            LocationScope::Rack => Some(format!(
                "{}.{}.{}",
                self.region, self.datacenter, self.rack
            )),
            LocationScope::Datacenter => Some(format!("{}.{}", self.region, self.datacenter)),
            LocationScope::Region => Some(self.region.clone()),
        }
    }
}

/// Replication requirement: for each scope, the number of distinct domains
/// of that scope that copies of a record must span.
///
/// `{Node: 3, Rack: 2}` means three copies on three nodes spread over at
/// least two racks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationProperty(BTreeMap<LocationScope, u8>);

impl ReplicationProperty {
    /// Largest replication factor accepted
    pub const MAX_REPLICATION: u8 = 15;

    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// `count` copies on distinct nodes
    #[must_use]
    pub fn nodes(count: u8) -> Self {
        Self::new().with(LocationScope::Node, count)
    }

    #[must_use]
    pub fn with(mut self, scope: LocationScope, count: u8) -> Self {
        self.0.insert(scope, count);
        self
    }

    /// Explicitly configured (scope, count) pairs, smallest scope first
    pub fn iter(&self) -> impl Iterator<Item = (LocationScope, u8)> + '_ {
        self.0.iter().map(|(s, c)| (*s, *c))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct domains of `scope` required, taking bigger scopes
    /// into account (two racks imply at least two nodes).
    #[must_use]
    pub fn effective(&self, scope: LocationScope) -> u8 {
        self.0
            .range(scope..)
            .map(|(_, c)| *c)
            .max()
            .unwrap_or(1)
    }

    /// Number of copies of every record
    #[must_use]
    pub fn replication_factor(&self) -> u8 {
        self.effective(LocationScope::Node)
    }

    /// Biggest scope with an explicit requirement
    #[must_use]
    pub fn biggest_scope(&self) -> LocationScope {
        self.0
            .keys()
            .next_back()
            .copied()
            .unwrap_or(LocationScope::Node)
    }

    /// Check the property is usable
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::invalid_param("replication property is empty"));
        }
        if let Some((scope, _)) = self.0.iter().find(|(_, c)| **c == 0) {
            return Err(Error::invalid_param(format!(
                "replication count for {scope} must be positive"
            )));
        }
        if self.replication_factor() > Self::MAX_REPLICATION {
            return Err(Error::invalid_param(format!(
                "replication factor {} exceeds {}",
                self.replication_factor(),
                Self::MAX_REPLICATION
            )));
        }
        Ok(())
    }

    /// Per-scope minimum of two properties, keeping only the scopes whose
    /// requirement is not already implied by a bigger one.
    #[must_use]
    pub fn narrowest(&self, other: &Self) -> Self {
        let mut counts: Vec<(LocationScope, u8)> = LocationScope::ALL
            .iter()
            .map(|s| (*s, self.effective(*s).min(other.effective(*s))))
            .collect();
        // Walk from the biggest scope down, dropping counts equal to the one
        // above them.
        counts.reverse();
        let mut out = BTreeMap::new();
        let mut above = 1;
        for (scope, count) in counts {
            if count > above || scope == LocationScope::Node {
                out.insert(scope, count);
            }
            above = above.max(count);
        }
        Self(out)
    }
}

impl fmt::Display for ReplicationProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (scope, count)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{scope}: {count}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_counts() {
        let p = ReplicationProperty::nodes(3).with(LocationScope::Rack, 2);
        assert_eq!(p.replication_factor(), 3);
        assert_eq!(p.effective(LocationScope::Rack), 2);
        assert_eq!(p.effective(LocationScope::Region), 1);
        assert_eq!(p.biggest_scope(), LocationScope::Rack);

        let racks_only = ReplicationProperty::new().with(LocationScope::Rack, 2);
        assert_eq!(racks_only.replication_factor(), 2);
    }

    #[test]
    fn test_validate() {
        assert!(ReplicationProperty::nodes(2).validate().is_ok());
        assert!(ReplicationProperty::new().validate().is_err());
        assert!(ReplicationProperty::nodes(0).validate().is_err());
        assert!(ReplicationProperty::nodes(16).validate().is_err());
    }

    #[test]
    fn test_narrowest() {
        let a = ReplicationProperty::nodes(3);
        let b = ReplicationProperty::nodes(3).with(LocationScope::Rack, 2);
        assert_eq!(a.narrowest(&b), ReplicationProperty::nodes(3));

        let c = ReplicationProperty::nodes(2).with(LocationScope::Rack, 2);
        let d = ReplicationProperty::nodes(4).with(LocationScope::Datacenter, 3);
        let n = c.narrowest(&d);
        assert_eq!(n.replication_factor(), 2);
        assert_eq!(n.biggest_scope(), LocationScope::Rack);
        assert_eq!(n.effective(LocationScope::Datacenter), 1);
    }

    #[test]
    fn test_domain_labels() {
        let loc = NodeLocation::new("eu", "dc1", "r1");
        assert_eq!(loc.domain(LocationScope::Rack).as_deref(), Some("eu.dc1.r1"));
        assert_eq!(loc.domain(LocationScope::Region).as_deref(), Some("eu"));
        assert_eq!(loc.domain(LocationScope::Node), None);
    }
}
