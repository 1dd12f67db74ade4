//! Session configuration.
//!
//! The stack consumes structured values; whatever produced them (an XML
//! loader, TOML, hand-written code) stays outside. The TOML path below is
//! what the tests and demos use.

use crate::dict::{ComIdMapping, Dataset};
use crate::error::{Result, TrdpError};
use keel::logging;
use serde_derive::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PD_PORT: u16 = 17224;
pub const DEFAULT_MD_PORT: u16 = 17225;
pub const DEFAULT_PD_QOS: u8 = 5;
pub const DEFAULT_MD_QOS: u8 = 3;
pub const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub size: usize,
    pub count: usize,
}

/// Pre-allocation table; empty means native allocator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub blocks: Vec<MemoryBlock>,
    #[serde(default)]
    pub initial_heap: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl Default for DebugLevel {
    fn default() -> DebugLevel {
        DebugLevel::Info
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Log file; absent logs to stderr.
    #[serde(default)]
    pub file_name: Option<PathBuf>,
    #[serde(default)]
    pub max_file_size: u64,
    #[serde(default)]
    pub level: DebugLevel,
}

impl DebugConfig {
    pub fn log_config(&self) -> logging::LogConfig {
        logging::LogConfig {
            file: self.file_name.clone(),
            max_file_size: self.max_file_size,
            level: match self.level {
                DebugLevel::Error => logging::Level::Error,
                DebugLevel::Warning => logging::Level::Warning,
                DebugLevel::Info => logging::Level::Info,
                DebugLevel::Debug => logging::Level::Debug,
                DebugLevel::Trace => logging::Level::Trace,
            },
        }
    }
}

/// One reusable set of send parameters, referenced by telegrams through its
/// id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComParameter {
    pub id: u32,
    /// DSCP value for the IP TOS byte.
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_ttl")]
    pub ttl: u8,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub vlan: u16,
    #[serde(default)]
    pub tsn: bool,
}

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub name: String,
    /// Address to bind; unspecified binds INADDR_ANY.
    #[serde(default = "default_host_ip")]
    pub host_ip: Ipv4Addr,
    /// Partner address in a redundant pair, kept for higher-level
    /// composition; the core does not act on it.
    #[serde(default)]
    pub leader_ip: Option<Ipv4Addr>,
    #[serde(default = "default_network_id")]
    pub network_id: u8,
}

fn default_host_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_network_id() -> u8 {
    1
}

impl Default for InterfaceConfig {
    fn default() -> InterfaceConfig {
        InterfaceConfig {
            name: String::new(),
            host_ip: default_host_ip(),
            leader_ip: None,
            network_id: default_network_id(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessOption {
    Default,
    Block,
    TrafficShape,
}

impl Default for ProcessOption {
    fn default() -> ProcessOption {
        ProcessOption::Default
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub leader_name: String,
    /// Nominal tick of the application's process loop, microseconds.
    #[serde(default = "default_cycle_us")]
    pub cycle_us: u32,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub option: ProcessOption,
}

fn default_cycle_us() -> u32 {
    10_000
}

impl Default for ProcessConfig {
    fn default() -> ProcessConfig {
        ProcessConfig {
            host_name: String::new(),
            leader_name: String::new(),
            cycle_us: default_cycle_us(),
            priority: 0,
            option: ProcessOption::Default,
        }
    }
}

/// What happens to a subscription's buffer when it times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutBehavior {
    SetToZero,
    KeepLastValue,
}

impl Default for TimeoutBehavior {
    fn default() -> TimeoutBehavior {
        TimeoutBehavior::SetToZero
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramFlags {
    /// Payload passes through the marshaller instead of raw copy.
    #[serde(default)]
    pub marshall: bool,
    /// Receive/timeout events invoke the registered callback.
    #[serde(default)]
    pub callback: bool,
    /// Message data rides a TCP connection instead of UDP.
    #[serde(default)]
    pub tcp: bool,
    /// Process-data frames carry a payload FCS.
    #[serde(default)]
    pub payload_fcs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdParameter {
    /// Publishing interval in microseconds; 0 means pull-only.
    #[serde(default)]
    pub cycle_us: u32,
    /// Redundancy group; 0 means not redundant.
    #[serde(default)]
    pub redundant: u32,
    /// Receive timeout in microseconds; 0 disables supervision.
    #[serde(default)]
    pub timeout_us: u32,
    #[serde(default)]
    pub to_behavior: TimeoutBehavior,
    #[serde(default)]
    pub flags: TelegramFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdParameter {
    #[serde(default)]
    pub confirm_timeout_us: u32,
    #[serde(default)]
    pub reply_timeout_us: u32,
    #[serde(default)]
    pub flags: TelegramFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: u32,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: u32,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    /// Second device of a redundant pair.
    #[serde(default)]
    pub ip2: Option<Ipv4Addr>,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Unset,
    Source,
    Sink,
    SourceSink,
}

impl Default for Direction {
    fn default() -> Direction {
        Direction::Unset
    }
}

/// One configured telegram: the ComId bound to its schema and transport
/// parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeParameter {
    pub com_id: u32,
    #[serde(default)]
    pub dataset_id: u32,
    #[serde(default)]
    pub com_par_id: u32,
    #[serde(default)]
    pub pd: Option<PdParameter>,
    #[serde(default)]
    pub md: Option<MdParameter>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub direction: Direction,
    /// Create the publisher/subscriber at session open.
    #[serde(default)]
    pub create: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdConfig {
    #[serde(default = "default_pd_port")]
    pub port: u16,
    #[serde(default = "default_pd_qos")]
    pub qos: u8,
    #[serde(default = "default_ttl")]
    pub ttl: u8,
    /// Default subscription timeout, microseconds.
    #[serde(default = "default_pd_timeout_us")]
    pub timeout_us: u32,
}

fn default_pd_port() -> u16 {
    DEFAULT_PD_PORT
}

fn default_pd_qos() -> u8 {
    DEFAULT_PD_QOS
}

fn default_pd_timeout_us() -> u32 {
    100_000
}

impl Default for PdConfig {
    fn default() -> PdConfig {
        PdConfig {
            port: DEFAULT_PD_PORT,
            qos: DEFAULT_PD_QOS,
            ttl: DEFAULT_TTL,
            timeout_us: default_pd_timeout_us(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdConfig {
    #[serde(default = "default_md_port")]
    pub udp_port: u16,
    #[serde(default = "default_md_port")]
    pub tcp_port: u16,
    #[serde(default = "default_md_qos")]
    pub qos: u8,
    #[serde(default = "default_ttl")]
    pub ttl: u8,
    #[serde(default = "default_reply_timeout_us")]
    pub reply_timeout_us: u32,
    #[serde(default = "default_confirm_timeout_us")]
    pub confirm_timeout_us: u32,
    /// TCP connections idle longer than this are closed.
    #[serde(default = "default_connect_timeout_us")]
    pub connect_timeout_us: u32,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_md_port() -> u16 {
    DEFAULT_MD_PORT
}

fn default_md_qos() -> u8 {
    DEFAULT_MD_QOS
}

fn default_reply_timeout_us() -> u32 {
    5_000_000
}

fn default_confirm_timeout_us() -> u32 {
    1_000_000
}

fn default_connect_timeout_us() -> u32 {
    60_000_000
}

fn default_retries() -> u32 {
    2
}

fn default_max_sessions() -> usize {
    64
}

impl Default for MdConfig {
    fn default() -> MdConfig {
        MdConfig {
            udp_port: DEFAULT_MD_PORT,
            tcp_port: DEFAULT_MD_PORT,
            qos: DEFAULT_MD_QOS,
            ttl: DEFAULT_TTL,
            reply_timeout_us: default_reply_timeout_us(),
            confirm_timeout_us: default_confirm_timeout_us(),
            connect_timeout_us: default_connect_timeout_us(),
            retries: default_retries(),
            max_sessions: default_max_sessions(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    #[serde(default)]
    pub pd: PdConfig,
    #[serde(default)]
    pub md: MdConfig,
    #[serde(default)]
    pub com_parameters: Vec<ComParameter>,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub com_mappings: Vec<ComIdMapping>,
    #[serde(default)]
    pub telegrams: Vec<ExchangeParameter>,
    /// Session-wide topology generation counters; frames carrying a
    /// different non-zero value are rejected.
    #[serde(default)]
    pub etb_topo_count: u32,
    #[serde(default)]
    pub op_trn_topo_count: u32,
}

impl SessionConfig {
    /// Loads a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<SessionConfig> {
        serdeconv::from_toml_file(path.as_ref())
            .map_err(|e| TrdpError::param(format!("configuration: {}", e)))
    }

    pub fn com_parameter(&self, id: u32) -> Option<&ComParameter> {
        self.com_parameters.iter().find(|p| p.id == id)
    }

    #[inline]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_micros(u64::from(self.md.reply_timeout_us))
    }

    #[inline]
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_micros(u64::from(self.md.confirm_timeout_us))
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_micros(u64::from(self.md.connect_timeout_us))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.pd.port, 17224);
        assert_eq!(cfg.md.udp_port, 17225);
        assert_eq!(cfg.md.tcp_port, 17225);
        assert_eq!(cfg.pd.qos, 5);
        assert_eq!(cfg.md.qos, 3);
        assert_eq!(cfg.pd.ttl, 64);
        assert_eq!(cfg.interface.host_ip, Ipv4Addr::UNSPECIFIED);
        assert!(cfg.memory.blocks.is_empty());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
            [interface]
            host_ip = "10.0.0.1"

            [pd]
            port = 20001

            [[datasets]]
            id = 1001
            name = "doors"
            elements = [
                { name = "count", type_id = 9 },
                { name = "states", type_id = 8, cardinality = 0 },
            ]

            [[com_mappings]]
            com_id = 2000
            dataset_id = 1001

            [[telegrams]]
            com_id = 2000
            dataset_id = 1001
            direction = "source"
            pd = { cycle_us = 100000 }
            destinations = [ { id = 1, ip = "239.0.0.1" } ]
        "#;
        let cfg: SessionConfig = serdeconv::from_toml_str(toml).unwrap();
        assert_eq!(cfg.interface.host_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(cfg.pd.port, 20001);
        assert_eq!(cfg.md.udp_port, 17225); // untouched section keeps defaults
        assert_eq!(cfg.datasets.len(), 1);
        assert_eq!(cfg.datasets[0].elements[1].cardinality, 0);
        assert_eq!(cfg.telegrams[0].direction, Direction::Source);
        assert_eq!(
            cfg.telegrams[0].destinations[0].ip,
            Some(Ipv4Addr::new(239, 0, 0, 1))
        );
    }

    #[test]
    fn test_com_parameter_lookup() {
        let mut cfg = SessionConfig::default();
        cfg.com_parameters.push(ComParameter {
            id: 3,
            qos: 7,
            ttl: 16,
            retries: 1,
            vlan: 0,
            tsn: false,
        });
        assert_eq!(cfg.com_parameter(3).unwrap().qos, 7);
        assert!(cfg.com_parameter(4).is_none());
    }

    #[test]
    fn test_debug_config_maps_to_log_config() {
        let dbg = DebugConfig {
            file_name: None,
            max_file_size: 0,
            level: DebugLevel::Trace,
        };
        assert_eq!(dbg.log_config().level, logging::Level::Trace);
    }
}
