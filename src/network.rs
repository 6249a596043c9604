//! Point-to-point links between the host and a worker's network namespace

use crate::{
    command,
    errors::Error,
    resource::{close_on_drop, Resource, ResourceState},
};
use nix::unistd::Pid;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv6Addr, path::Path, str::FromStr};

/// Interface names are limited to 15 bytes, and ours carry a 3 byte prefix
pub const MAX_LINK_ID: usize = 12;

const MASTER_PREFIX: &str = "jm.";
const SLAVE_PREFIX: &str = "js.";
const INTERFACE_PREFIX_LEN: u8 = 64;

/// An IPv6 address with its prefix length
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
}

impl Address {
    pub fn new(addr: Ipv6Addr, prefix_len: u8) -> Result<Self, Error> {
        if prefix_len > 128 {
            return Err(Error::InvalidAddress(format!("{}/{}", addr, prefix_len)));
        }
        Ok(Address { addr, prefix_len })
    }

    /// The address with every host bit cleared
    pub fn network(&self) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.addr) & prefix_mask(self.prefix_len))
    }

    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        u128::from(*addr) & prefix_mask(self.prefix_len) == u128::from(self.network())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let mut parts = s.splitn(2, '/');
        let addr = parts
            .next()
            .and_then(|addr| addr.parse().ok())
            .ok_or_else(invalid)?;
        let prefix_len = parts
            .next()
            .and_then(|len| len.parse().ok())
            .ok_or_else(invalid)?;
        Address::new(addr, prefix_len).map_err(|_| invalid())
    }
}

impl std::convert::TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> String {
        address.to_string()
    }
}

fn prefix_mask(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        len => !0u128 << (128 - len.min(128) as u32),
    }
}

/// A random locally administered unicast hardware address
pub fn random_mac<R: Rng>(rng: &mut R) -> [u8; 6] {
    let mut mac: [u8; 6] = rng.gen();
    mac[0] = (mac[0] & !0x01) | 0x02;
    mac
}

/// Modified EUI-64 interface identifier for a hardware address
pub fn interface_id(mac: &[u8; 6]) -> u64 {
    u64::from_be_bytes([
        mac[0] ^ 0x02,
        mac[1],
        mac[2],
        0xff,
        0xfe,
        mac[3],
        mac[4],
        mac[5],
    ])
}

/// Produces address pairs inside one private prefix
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressGenerator {
    subnet: Address,
}

impl AddressGenerator {
    /// Generate inside `subnet`, which must be at most a /64
    pub fn new(subnet: Address) -> Result<Self, Error> {
        if subnet.prefix_len > INTERFACE_PREFIX_LEN {
            return Err(Error::InvalidAddress(format!(
                "{} is longer than /{}",
                subnet, INTERFACE_PREFIX_LEN
            )));
        }
        Ok(AddressGenerator { subnet })
    }

    /// A random unique local /48, in fd00::/8
    pub fn random_subnet() -> Address {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xfd;
        rand::thread_rng().fill(&mut bytes[1..6]);
        Address {
            addr: Ipv6Addr::from(bytes),
            prefix_len: 48,
        }
    }

    pub fn subnet(&self) -> Address {
        self.subnet
    }

    /// Master and slave addresses on one shared, randomly chosen /64
    pub fn generate_pair(&self) -> (Address, Address) {
        let mut rng = rand::thread_rng();
        let subnet_bits = !prefix_mask(self.subnet.prefix_len) & prefix_mask(INTERFACE_PREFIX_LEN);
        let network = (u128::from(self.subnet.addr) & prefix_mask(self.subnet.prefix_len))
            | (rng.gen::<u128>() & subnet_bits);
        let endpoint = |rng: &mut rand::rngs::ThreadRng| Address {
            addr: Ipv6Addr::from(network | interface_id(&random_mac(rng)) as u128),
            prefix_len: INTERFACE_PREFIX_LEN,
        };
        let master = endpoint(&mut rng);
        loop {
            let slave = endpoint(&mut rng);
            if slave != master {
                return (master, slave);
            }
        }
    }
}

fn master_name(id: &str) -> String {
    format!("{}{}", MASTER_PREFIX, id)
}

fn slave_name(id: &str) -> String {
    format!("{}{}", SLAVE_PREFIX, id)
}

/// The end of a pair that moves into a worker's namespace
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlaveEndpoint {
    pub name: String,
    pub address: Address,
}

impl SlaveEndpoint {
    /// Reassign the link into the network namespace of `pid`
    pub fn move_to_namespace(&self, pid: Pid) -> Result<(), Error> {
        command::run("ip", &["link", "set", &self.name, "netns", &pid.to_string()])?;
        Ok(())
    }

    /// Finish configuration from inside the namespace
    pub fn finish_configuration(&self) -> Result<(), Error> {
        command::run("ip", &["link", "set", "lo", "up"])?;
        command::run(
            "ip",
            &[
                "addr",
                "add",
                &self.address.to_string(),
                "dev",
                &self.name,
                "nodad",
            ],
        )?;
        command::run("ip", &["link", "set", &self.name, "up"])?;
        Ok(())
    }
}

/// A veth pair, deleted on close
#[derive(Debug)]
pub struct NetworkPair {
    id: String,
    master: Address,
    slave: Address,
    state: ResourceState,
}

impl NetworkPair {
    /// Create `jm.<id>` and `js.<id>`, configure and bring up the master
    pub fn create(generator: &AddressGenerator, id: &str) -> Result<NetworkPair, Error> {
        if id.is_empty() || id.len() > MAX_LINK_ID || id.contains(|c: char| c == '/' || c.is_whitespace()) {
            return Err(Error::InvalidConfig(format!("unusable link id {:?}", id)));
        }
        let (master, slave) = generator.generate_pair();
        command::run(
            "ip",
            &[
                "link",
                "add",
                "name",
                &master_name(id),
                "type",
                "veth",
                "peer",
                "name",
                &slave_name(id),
            ],
        )?;
        let pair = NetworkPair {
            id: id.to_string(),
            master,
            slave,
            state: ResourceState::Open,
        };
        command::run(
            "ip",
            &[
                "addr",
                "add",
                &master.to_string(),
                "dev",
                &pair.master_name(),
                "valid_lft",
                "forever",
                "preferred_lft",
                "forever",
                "nodad",
            ],
        )?;
        command::run("ip", &["link", "set", &pair.master_name(), "up"])?;
        Ok(pair)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn master_name(&self) -> String {
        master_name(&self.id)
    }

    pub fn slave_name(&self) -> String {
        slave_name(&self.id)
    }

    pub fn master_address(&self) -> Address {
        self.master
    }

    pub fn slave_address(&self) -> Address {
        self.slave
    }

    pub fn endpoint(&self) -> SlaveEndpoint {
        SlaveEndpoint {
            name: self.slave_name(),
            address: self.slave,
        }
    }

    pub fn move_to_namespace(&self, pid: Pid) -> Result<(), Error> {
        self.endpoint().move_to_namespace(pid)
    }
}

impl Resource for NetworkPair {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            let name = self.master_name();
            if let Err(err) = command::run("ip", &["link", "del", &name]) {
                // Both ends go away with the worker's namespace
                if Path::new("/sys/class/net").join(&name).exists() {
                    return Err(err);
                }
                log::debug!("link {} was already gone", name);
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.state.release()
    }
}

impl Drop for NetworkPair {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}
