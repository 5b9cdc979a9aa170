use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the server listens on. Port 0 picks a free port.
    pub address: SocketAddr,
    // Maximum number of connections we serve at the same time.
    pub max_conc_res: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 4669).into(),
            max_conc_res: 50,
        }
    }
}
