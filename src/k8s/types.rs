use k8s_openapi::api::core::v1::Node;
use std::fmt;
use std::str::FromStr;

/// Kinds of addresses a node can report in its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAddressType {
    Hostname,
    InternalDns,
    InternalIp,
    ExternalDns,
    ExternalIp,
}

impl NodeAddressType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NodeAddressType::Hostname => "Hostname",
            NodeAddressType::InternalDns => "InternalDNS",
            NodeAddressType::InternalIp => "InternalIP",
            NodeAddressType::ExternalDns => "ExternalDNS",
            NodeAddressType::ExternalIp => "ExternalIP",
        }
    }

    /// Order used when no preference is configured.
    pub fn default_preference() -> Vec<NodeAddressType> {
        vec![
            NodeAddressType::Hostname,
            NodeAddressType::InternalDns,
            NodeAddressType::InternalIp,
            NodeAddressType::ExternalDns,
            NodeAddressType::ExternalIp,
        ]
    }
}

impl fmt::Display for NodeAddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeAddressType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Hostname" => Ok(NodeAddressType::Hostname),
            "InternalDNS" => Ok(NodeAddressType::InternalDns),
            "InternalIP" => Ok(NodeAddressType::InternalIp),
            "ExternalDNS" => Ok(NodeAddressType::ExternalDns),
            "ExternalIP" => Ok(NodeAddressType::ExternalIp),
            other => Err(format!("unknown node address type: {}", other)),
        }
    }
}

/// Pick the first address of the node matching the preference order.
pub fn preferred_address(node: &Node, preference: &[NodeAddressType]) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;

    preference.iter().find_map(|wanted| {
        addresses
            .iter()
            .find(|a| a.type_ == wanted.as_str() && !a.address.is_empty())
            .map(|a| a.address.clone())
    })
}
