const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Address the coordinator and the API listen on by default
pub fn get_default_host() -> String {
    DEFAULT_BIND_HOST.to_string()
}

const COORDINATOR_HOST: &str = "COORDINATOR_HOST";

const DEFAULT_COORDINATOR_HOST: &str = "127.0.0.1";

/// Address nodes connect to
pub fn get_coordinator_host() -> String {
    std::env::var(COORDINATOR_HOST).unwrap_or_else(|_| DEFAULT_COORDINATOR_HOST.to_string())
}

const COORDINATOR_PORT: &str = "COORDINATOR_PORT";

const DEFAULT_PORT: u16 = 9000;

pub fn get_default_port() -> u16 {
    DEFAULT_PORT
}

pub fn get_coordinator_port() -> u16 {
    let port_from_env = std::env::var(COORDINATOR_PORT);
    port_from_env.map_or(DEFAULT_PORT, |res| res.parse().unwrap_or(DEFAULT_PORT))
}

const NODE_ID: &str = "NODE_ID";

/// Node id from the environment, falling back to the host name
pub fn get_node_id() -> String {
    std::env::var(NODE_ID)
        .ok()
        .filter(|id| !id.trim().is_empty())
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| format!("node-{}", std::process::id()))
}
