//! Module specification value types.
//!
//! These structures are the parsed, admission-checked form of a module
//! spec as delivered by the external reconciler:
//! - [`ModuleKey`]: namespace-qualified module identity
//! - [`ModuleSpec`]: declared image, mounts, network policy, and resources
//! - [`VolumeDeclaration`]: a named volume mount with an explicit sharing flag
//! - [`NetworkPolicy`]: socket permissions expressed as address patterns
//! - [`ResourceRequest`]: memory and CPU quantities in Kubernetes notation

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fuel units granted per CPU millicore (1m = 1M fuel).
pub const FUEL_PER_MILLICORE: u64 = 1_000_000;

/// Namespace-qualified module identity.
///
/// Displayed and serialized as `namespace/name`. Two modules with the same
/// name in different namespaces are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    namespace: String,
    name: String,
}

impl ModuleKey {
    /// Create a new module key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The module's namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The module's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hostname this module serves under: `{name}.{namespace}.{domain}`.
    pub fn hostname(&self, domain: &str) -> String {
        format!("{}.{}.{}", self.name, self.namespace, domain)
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired state of a module, as declared by its owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// OCI artifact containing the WASM module. Required.
    pub image: String,

    /// Command line arguments passed to the module.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables set in the module.
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Volumes to mount as WASI preopened directories.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeDeclaration>,

    /// Compute resource requests. Memory maps to linear-memory limits,
    /// CPU is converted to fuel.
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Network access configuration. Absent means no network access.
    #[serde(default)]
    pub network: Option<NetworkPolicy>,

    /// Pin the module to a named, dedicated runner.
    #[serde(default)]
    pub runner: Option<String>,

    /// Names of modules (same namespace) this module calls, used as a
    /// co-location hint by the scheduler.
    #[serde(default)]
    pub colocate_with: Vec<String>,
}

/// A single environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// A named volume mount with an explicit sharing flag.
///
/// Two modules on the same runner may reference the same volume name only
/// when both declare `shared: true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDeclaration {
    /// Volume name, matched against the runner's volume profile.
    pub name: String,

    /// Guest path the volume is preopened at.
    pub guest_path: String,

    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,

    /// Opt in to co-location with other modules mounting the same volume.
    #[serde(default)]
    pub shared: bool,
}

/// Memory and CPU requests in Kubernetes quantity notation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Memory quantity, e.g. "64Mi". Maps to the linear memory limit.
    #[serde(default)]
    pub memory: Option<String>,

    /// CPU quantity, e.g. "100m". Converted to fuel units.
    #[serde(default)]
    pub cpu: Option<String>,
}

impl ResourceRequest {
    /// Requested memory in bytes, if a parsable quantity was declared.
    pub fn memory_bytes(&self) -> Option<u64> {
        self.memory.as_deref().and_then(parse_memory_quantity)
    }

    /// Fuel budget derived from the CPU quantity (1m = 1M fuel).
    pub fn fuel(&self) -> Option<u64> {
        self.cpu
            .as_deref()
            .and_then(parse_cpu_millis)
            .map(|millis| millis * FUEL_PER_MILLICORE)
    }
}

/// Network access configuration for WASI sockets.
///
/// Address patterns take the form `host:port`; both sides accept `*` as a
/// wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    /// Inherit the host's full network stack.
    #[serde(default)]
    pub inherit: bool,

    /// Enable DNS resolution. Defaults to true when a policy is present.
    #[serde(default = "default_true")]
    pub allow_ip_name_lookup: bool,

    /// TCP socket permissions.
    #[serde(default)]
    pub tcp: Option<TcpRules>,

    /// UDP socket permissions.
    #[serde(default)]
    pub udp: Option<UdpRules>,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            inherit: false,
            allow_ip_name_lookup: true,
            tcp: None,
            udp: None,
        }
    }
}

/// TCP socket permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRules {
    /// Address patterns allowed for TCP bind.
    #[serde(default)]
    pub bind: Vec<String>,

    /// Address patterns allowed for TCP connect.
    #[serde(default)]
    pub connect: Vec<String>,
}

/// UDP socket permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpRules {
    /// Address patterns allowed for UDP bind.
    #[serde(default)]
    pub bind: Vec<String>,

    /// Address patterns allowed for UDP connect.
    #[serde(default)]
    pub connect: Vec<String>,

    /// Address patterns allowed for UDP outgoing datagrams.
    #[serde(default)]
    pub outgoing: Vec<String>,
}

impl NetworkPolicy {
    /// Concrete ports this policy binds, collected from TCP and UDP bind
    /// patterns. Wildcard-port patterns do not resolve to a port and are
    /// not included.
    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        let patterns = self
            .tcp
            .iter()
            .flat_map(|t| t.bind.iter())
            .chain(self.udp.iter().flat_map(|u| u.bind.iter()));

        for pattern in patterns {
            if let Some(port) = pattern
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse::<u16>().ok())
            {
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }
        ports
    }

    /// All address patterns declared by this policy.
    pub fn all_patterns(&self) -> impl Iterator<Item = &str> {
        let tcp = self
            .tcp
            .iter()
            .flat_map(|t| t.bind.iter().chain(t.connect.iter()));
        let udp = self
            .udp
            .iter()
            .flat_map(|u| u.bind.iter().chain(u.connect.iter()).chain(u.outgoing.iter()));
        tcp.chain(udp).map(String::as_str)
    }
}

impl ModuleSpec {
    /// Ports this module binds, derived from its network policy.
    pub fn bound_ports(&self) -> Vec<u16> {
        self.network
            .as_ref()
            .map(NetworkPolicy::bound_ports)
            .unwrap_or_default()
    }

    /// Volume names this module requires.
    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.volume_mounts.iter().map(|m| m.name.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// Validate an address pattern of the form `host:port`, where either side
/// may be `*`.
pub fn validate_address_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("address pattern cannot be empty".into());
    }
    // "*:*" is the shortest well-formed pattern
    if !pattern.contains(':') || pattern.len() < 3 {
        return Err(format!(
            "address pattern '{pattern}' must be in format 'host:port'"
        ));
    }
    Ok(())
}

/// Parse a Kubernetes memory quantity to bytes.
///
/// Supports binary suffixes (Ki, Mi, Gi, Ti, Pi, Ei) and decimal suffixes
/// (k, M, G, T, P, E); a bare number is bytes.
pub fn parse_memory_quantity(s: &str) -> Option<u64> {
    const BINARY: &[(&str, u64)] = &[
        ("Ei", 1 << 60),
        ("Pi", 1 << 50),
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
    ];
    const DECIMAL: &[(&str, u64)] = &[
        ("E", 1_000_000_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("k", 1_000),
    ];

    let s = s.trim();
    for (suffix, scale) in BINARY.iter().chain(DECIMAL) {
        if let Some(num) = s.strip_suffix(suffix) {
            return num.parse::<u64>().ok().map(|n| n * scale);
        }
    }
    s.parse::<u64>().ok()
}

/// Parse a Kubernetes CPU quantity to millicores.
///
/// "100m" is 100 millicores; "1" is 1000; "0.5" is 500.
pub fn parse_cpu_millis(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(num) = s.strip_suffix('m') {
        num.parse::<u64>().ok()
    } else if let Ok(cores) = s.parse::<f64>() {
        if cores < 0.0 {
            return None;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (cores * 1000.0) as u64;
        Some(millis)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_key_display() {
        let key = ModuleKey::new("default", "reverse-text");
        assert_eq!(key.to_string(), "default/reverse-text");
        assert_eq!(key.namespace(), "default");
        assert_eq!(key.name(), "reverse-text");
    }

    #[test]
    fn test_module_key_hostname() {
        let key = ModuleKey::new("prod", "api");
        assert_eq!(key.hostname("example.com"), "api.prod.example.com");
    }

    #[test]
    fn test_parse_memory_quantity() {
        assert_eq!(parse_memory_quantity("64Mi"), Some(64 * 1024 * 1024));
        assert_eq!(parse_memory_quantity("1Gi"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_quantity("512Ki"), Some(512 * 1024));
        assert_eq!(parse_memory_quantity("1M"), Some(1_000_000));
        assert_eq!(parse_memory_quantity("1000"), Some(1000));
        assert_eq!(parse_memory_quantity("bogus"), None);
    }

    #[test]
    fn test_parse_cpu_millis() {
        assert_eq!(parse_cpu_millis("100m"), Some(100));
        assert_eq!(parse_cpu_millis("1"), Some(1000));
        assert_eq!(parse_cpu_millis("0.5"), Some(500));
        assert_eq!(parse_cpu_millis("two"), None);
    }

    #[test]
    fn test_resource_request_fuel() {
        let resources = ResourceRequest {
            memory: Some("64Mi".into()),
            cpu: Some("100m".into()),
        };
        assert_eq!(resources.memory_bytes(), Some(64 * 1024 * 1024));
        assert_eq!(resources.fuel(), Some(100 * FUEL_PER_MILLICORE));

        let empty = ResourceRequest::default();
        assert_eq!(empty.memory_bytes(), None);
        assert_eq!(empty.fuel(), None);
    }

    #[test]
    fn test_validate_address_pattern() {
        assert!(validate_address_pattern("127.0.0.1:8080").is_ok());
        assert!(validate_address_pattern("*:8080").is_ok());
        assert!(validate_address_pattern("example.com:*").is_ok());
        assert!(validate_address_pattern("*:*").is_ok());

        assert!(validate_address_pattern("").is_err());
        assert!(validate_address_pattern("8080").is_err());
        assert!(validate_address_pattern(":").is_err());
    }

    #[test]
    fn test_bound_ports() {
        let policy = NetworkPolicy {
            tcp: Some(TcpRules {
                bind: vec!["*:8080".into(), "127.0.0.1:9000".into()],
                connect: vec!["*:443".into()],
            }),
            udp: Some(UdpRules {
                bind: vec!["*:8080".into(), "*:*".into()],
                ..Default::default()
            }),
            ..Default::default()
        };

        // Connect patterns and wildcard ports do not bind
        assert_eq!(policy.bound_ports(), vec![8080, 9000]);
    }

    #[test]
    fn test_spec_deserialization_defaults() {
        let json = r#"{"image": "ghcr.io/example/hello:latest"}"#;
        let spec: ModuleSpec = serde_json::from_str(json).unwrap();

        assert_eq!(spec.image, "ghcr.io/example/hello:latest");
        assert!(spec.args.is_empty());
        assert!(spec.volume_mounts.is_empty());
        assert!(spec.network.is_none());
        assert!(spec.runner.is_none());
    }

    #[test]
    fn test_network_policy_defaults() {
        let json = r#"{"tcp": {"bind": ["*:8080"]}}"#;
        let policy: NetworkPolicy = serde_json::from_str(json).unwrap();

        assert!(!policy.inherit);
        // DNS resolution defaults to enabled when a policy is present
        assert!(policy.allow_ip_name_lookup);
    }
}
