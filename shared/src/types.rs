use std::fmt;
use std::net::SocketAddr;
use serde::{Serialize, Deserialize};

/// One channel of an inbound search, as handed to the search handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search sequence number chosen by the client
    pub seq: u32,

    /// Client-side channel id, echoed back in a search response
    pub cid: u32,

    /// PV name being searched for
    pub name: String,

    /// Where the client expects the search response
    pub client: SocketAddr,
}

/// A channel record as returned by the ChannelFinder directory service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,

    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default)]
    pub properties: Vec<Property>,

    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Property {
    pub name: String,

    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,

    #[serde(default)]
    pub owner: Option<String>,
}

impl Channel {
    /// Value of the first property whose name matches, ignoring ASCII case.
    /// A property without a value counts as absent.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.value.as_deref())
    }
}

/// Override address for a PV: where its IOC actually listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
