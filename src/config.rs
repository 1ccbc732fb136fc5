//! Construction parameters for the datapath (§6 external interfaces).
//!
//! IPv6 is rejected structurally: every address field here is a
//! [`std::net::Ipv4Addr`], not the dual-stack [`std::net::IpAddr`], so there
//! is no IPv6 value to validate against in the first place.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("mtu must be large enough to carry an IPv4 header plus at least 8 bytes of payload")]
    MtuTooSmall,
    #[error("gateway and mirror addresses must differ")]
    GatewayEqualsMirror,
}

/// Bounds and addressing the datapath runs under. See the module
/// [`crate`] docs for how `gateway` and `mirror` relate to the guest's
/// view of the network.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub mtu: usize,
    pub gateway: Ipv4Addr,
    pub mirror: Ipv4Addr,
    /// Capacity of the NAT table (`N` in the design notes).
    pub nat_capacity: usize,
    /// Capacity of the fragment tracker map (`M` in the design notes).
    pub max_fragment_trackers: usize,
    /// Number of dispatcher worker threads.
    pub dispatcher_workers: usize,
    /// Per-queue channel capacity between pipeline stages.
    pub channel_capacity: usize,
}

impl Config {
    pub fn new(mtu: usize, gateway: Ipv4Addr, mirror: Ipv4Addr) -> Result<Config, ConfigError> {
        let config = Config {
            mtu,
            gateway,
            mirror,
            nat_capacity: crate::nat::DEFAULT_CAPACITY,
            max_fragment_trackers: crate::frag::DEFAULT_MAX_TRACKERS,
            dispatcher_workers: 4,
            channel_capacity: 32,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < crate::wire::IPV4_HEADER_LEN + 8 {
            return Err(ConfigError::MtuTooSmall);
        }
        if self.gateway == self.mirror {
            return Err(ConfigError::GatewayEqualsMirror);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mtu_too_small_for_a_header() {
        let err = Config::new(20, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)).unwrap_err();
        assert_eq!(err, ConfigError::MtuTooSmall);
    }

    #[test]
    fn rejects_identical_gateway_and_mirror() {
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let err = Config::new(1500, addr, addr).unwrap_err();
        assert_eq!(err, ConfigError::GatewayEqualsMirror);
    }

    #[test]
    fn accepts_a_sane_configuration() {
        assert!(Config::new(1500, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 254)).is_ok());
    }
}
