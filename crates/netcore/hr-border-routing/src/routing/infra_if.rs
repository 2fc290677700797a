//! The infrastructure link as seen by the policy engine.

use std::net::Ipv6Addr;

use crate::error::Result;

pub trait InfraIf {
    /// Whether the interface is up and usable.
    fn is_running(&self) -> bool;

    /// Whether `address` is assigned to the interface.
    fn has_address(&self, address: &Ipv6Addr) -> bool;

    fn link_layer_address(&self) -> Option<Vec<u8>>;

    /// Sends an ICMPv6 message (checksum left to the kernel) with hop limit
    /// 255.
    fn send_icmp6(&mut self, message: &[u8], dest: Ipv6Addr) -> Result<()>;

    /// Sends a DHCPv6 message to port 547 of `dest`.
    fn send_dhcp6(&mut self, message: &[u8], dest: Ipv6Addr) -> Result<()>;

    /// Starts discovery of the infrastructure NAT64 prefix. The result is
    /// delivered later through `RoutingManager::handle_nat64_discover_done`.
    fn discover_nat64_prefix(&mut self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::Error;

    /// Records everything sent through it.
    #[derive(Debug, Default)]
    pub struct FakeInfraIf {
        pub running: bool,
        pub addresses: Vec<Ipv6Addr>,
        pub icmp6_sent: Vec<(Vec<u8>, Ipv6Addr)>,
        pub dhcp6_sent: Vec<(Vec<u8>, Ipv6Addr)>,
        pub nat64_discoveries: usize,
        pub fail_sends: bool,
    }

    impl FakeInfraIf {
        pub fn new() -> Self {
            Self {
                running: true,
                ..Self::default()
            }
        }

        pub fn sent_of_type(&self, icmp_type: u8) -> Vec<&(Vec<u8>, Ipv6Addr)> {
            self.icmp6_sent.iter().filter(|(m, _)| m.first() == Some(&icmp_type)).collect()
        }
    }

    impl InfraIf for FakeInfraIf {
        fn is_running(&self) -> bool {
            self.running
        }

        fn has_address(&self, address: &Ipv6Addr) -> bool {
            self.addresses.contains(address)
        }

        fn link_layer_address(&self) -> Option<Vec<u8>> {
            Some(vec![0x02, 0, 0, 0, 0, 0x01])
        }

        fn send_icmp6(&mut self, message: &[u8], dest: Ipv6Addr) -> Result<()> {
            if self.fail_sends {
                return Err(Error::NoBufs);
            }
            self.icmp6_sent.push((message.to_vec(), dest));
            Ok(())
        }

        fn send_dhcp6(&mut self, message: &[u8], dest: Ipv6Addr) -> Result<()> {
            if self.fail_sends {
                return Err(Error::NoBufs);
            }
            self.dhcp6_sent.push((message.to_vec(), dest));
            Ok(())
        }

        fn discover_nat64_prefix(&mut self) -> Result<()> {
            self.nat64_discoveries += 1;
            Ok(())
        }
    }
}
