/// Configuration of an [`Rpc`](crate::Rpc) endpoint.
///
/// The defaults suit a single-switch datacenter fabric; override fields with
/// struct-update syntax:
///
/// ```
/// use fabrpc::Config;
///
/// let config = Config {
///     session_slots: 16,
///     ..Config::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Physical port of the NIC to bind to (verbs transports only).
    pub phy_port: u8,

    /// NUMA node to bind all arena memory to. `None` leaves placement to the
    /// OS; when set, allocation fails if the binding cannot be enforced.
    pub numa_node: Option<u32>,

    /// Request slots per session. This is also the session credit window:
    /// at most this many requests can be outstanding on one session.
    pub session_slots: usize,

    /// Depth of the transport receive ring, in packets.
    pub rx_ring_size: usize,

    /// Transport MTU in bytes, including the packet header.
    pub mtu: usize,

    /// Probability of dropping an outbound data-plane packet before it
    /// reaches the transport. Zero in production; used by loss tests to
    /// exercise the retransmission path.
    pub pkt_loss_prob: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            phy_port: 1,
            numa_node: None,
            session_slots: 8,
            rx_ring_size: 4096,
            mtu: 4096,
            pkt_loss_prob: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.session_slots, 8);
        assert_eq!(config.rx_ring_size, 4096);
        assert_eq!(config.mtu, 4096);
        assert_eq!(config.pkt_loss_prob, 0.0);
        assert!(config.numa_node.is_none());
    }
}
