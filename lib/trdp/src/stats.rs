//! Session statistics. Counters are bumped inside `process` and the API
//! calls; `Session::statistics` hands out a copy.

#[derive(Debug, Default, Clone)]
pub struct PdStatistics {
    pub sent: u64,
    pub received: u64,
    pub crc_errors: u64,
    pub wire_errors: u64,
    pub topo_errors: u64,
    pub sequence_drops: u64,
    pub no_subscriber: u64,
    pub timeouts: u64,
    pub pulls_answered: u64,
}

#[derive(Debug, Default, Clone)]
pub struct MdStatistics {
    pub sent: u64,
    pub received: u64,
    pub crc_errors: u64,
    pub wire_errors: u64,
    pub topo_errors: u64,
    pub retries: u64,
    pub reply_timeouts: u64,
    pub confirm_timeouts: u64,
    pub unknown_sessions: u64,
    pub no_listener: u64,
}

#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub pd: PdStatistics,
    pub md: MdStatistics,
    /// Sockets condemned and scheduled for reopening.
    pub socket_failures: u64,
}
