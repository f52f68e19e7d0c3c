//! Isolated subnet planning.
//!
//! Spoke networks get deterministic, non-overlapping IPv4 blocks: each block
//! starts where the previous one ended (base address plus block size). The
//! first host of a block is the gateway, and the allocation pool covers the
//! remaining hosts up to the address before broadcast.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Smallest block that still holds a gateway and one pool address
const MAX_PREFIX: u8 = 30;

/// Errors raised while planning subnets
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Prefix /{prefix} leaves no room for a gateway and an allocation pool")]
    PrefixTooLong { prefix: u8 },

    #[error("IPv4 address space exhausted for /{prefix} blocks")]
    Exhausted { prefix: u8 },
}

/// Addressing plan of a single subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetPlan {
    pub cidr: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
}

impl SubnetPlan {
    /// Plan a subnet for the block containing `cidr`
    pub fn from_cidr(cidr: Ipv4Network) -> Result<Self, PlanError> {
        let prefix = cidr.prefix();
        if prefix > MAX_PREFIX {
            return Err(PlanError::PrefixTooLong { prefix });
        }
        let base = u32::from(cidr.network());
        let size = block_size(prefix);
        let last = base as u64 + size - 1; // broadcast

        let cidr = Ipv4Network::new(cidr.network(), prefix).map_err(|_| PlanError::PrefixTooLong { prefix })?;
        Ok(SubnetPlan {
            cidr,
            gateway: Ipv4Addr::from(base + 1),
            pool_start: Ipv4Addr::from(base + 2),
            pool_end: Ipv4Addr::from((last - 1) as u32),
        })
    }

    /// Whether `addr` may be handed out by the subnet's DHCP pool
    pub fn in_pool(&self, addr: Ipv4Addr) -> bool {
        addr >= self.pool_start && addr <= self.pool_end
    }

    /// Number of addresses in the allocation pool
    pub fn pool_len(&self) -> u32 {
        u32::from(self.pool_end) - u32::from(self.pool_start) + 1
    }
}

/// Hands out consecutive, non-overlapping blocks of one prefix length
#[derive(Debug, Clone)]
pub struct SubnetAllocator {
    prefix: u8,
    next_base: Option<u32>,
}

impl SubnetAllocator {
    /// Start allocating at the block containing `first`
    pub fn new(first: Ipv4Network) -> Result<Self, PlanError> {
        let prefix = first.prefix();
        if prefix > MAX_PREFIX {
            return Err(PlanError::PrefixTooLong { prefix });
        }
        Ok(SubnetAllocator {
            prefix,
            next_base: Some(u32::from(first.network())),
        })
    }

    /// Plan the next block: previous base + block size
    pub fn next_plan(&mut self) -> Result<SubnetPlan, PlanError> {
        let base = self.next_base.ok_or(PlanError::Exhausted { prefix: self.prefix })?;
        let cidr = Ipv4Network::new(Ipv4Addr::from(base), self.prefix)
            .map_err(|_| PlanError::PrefixTooLong { prefix: self.prefix })?;
        let plan = SubnetPlan::from_cidr(cidr)?;

        let next = base as u64 + block_size(self.prefix);
        self.next_base = u32::try_from(next).ok();

        log::debug!("Planned subnet {} (gateway {})", plan.cidr, plan.gateway);
        Ok(plan)
    }

    /// Plan `count` consecutive blocks
    pub fn take(&mut self, count: usize) -> Result<Vec<SubnetPlan>, PlanError> {
        (0..count).map(|_| self.next_plan()).collect()
    }
}

fn block_size(prefix: u8) -> u64 {
    1u64 << (32 - prefix as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_plan_gateway_and_pool() {
        let plan = SubnetPlan::from_cidr(net("10.100.0.0/24")).unwrap();
        assert_eq!(plan.gateway, Ipv4Addr::new(10, 100, 0, 1));
        assert_eq!(plan.pool_start, Ipv4Addr::new(10, 100, 0, 2));
        assert_eq!(plan.pool_end, Ipv4Addr::new(10, 100, 0, 254));
        assert_eq!(plan.pool_len(), 253);
        assert!(!plan.in_pool(plan.gateway));
    }

    #[test]
    fn test_plan_aligns_host_bits() {
        let plan = SubnetPlan::from_cidr(net("10.0.0.77/28")).unwrap();
        assert_eq!(plan.cidr, net("10.0.0.64/28"));
        assert_eq!(plan.gateway, Ipv4Addr::new(10, 0, 0, 65));
        assert_eq!(plan.pool_end, Ipv4Addr::new(10, 0, 0, 78));
    }

    #[test]
    fn test_consecutive_blocks_do_not_overlap() {
        let mut allocator = SubnetAllocator::new(net("10.200.0.0/28")).unwrap();
        let plans = allocator.take(4).unwrap();

        let bases: Vec<_> = plans.iter().map(|p| p.cidr.network()).collect();
        assert_eq!(
            bases,
            vec![
                Ipv4Addr::new(10, 200, 0, 0),
                Ipv4Addr::new(10, 200, 0, 16),
                Ipv4Addr::new(10, 200, 0, 32),
                Ipv4Addr::new(10, 200, 0, 48),
            ]
        );
        for pair in plans.windows(2) {
            assert!(!pair[0].cidr.contains(pair[1].cidr.network()));
        }
    }

    #[test]
    fn test_block_crosses_octet_boundary() {
        let mut allocator = SubnetAllocator::new(net("10.0.255.0/24")).unwrap();
        allocator.next_plan().unwrap();
        assert_eq!(allocator.next_plan().unwrap().cidr, net("10.1.0.0/24"));
    }

    #[test]
    fn test_exhaustion() {
        let mut allocator = SubnetAllocator::new(net("255.255.255.0/24")).unwrap();
        assert!(allocator.next_plan().is_ok());
        assert!(matches!(allocator.next_plan(), Err(PlanError::Exhausted { .. })));
    }

    #[test]
    fn test_rejects_tiny_prefix() {
        assert_eq!(
            SubnetAllocator::new(net("10.0.0.0/31")).unwrap_err(),
            PlanError::PrefixTooLong { prefix: 31 }
        );
    }
}
