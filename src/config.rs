use std::sync::Arc;

/// Minimum accepted value for [`ClientConfig::max_packet`], matching the smallest
/// packet size OpenSSH's own sftp-server will negotiate down to.
pub const MIN_MAX_PACKET: u32 = 8192;
const DEFAULT_MAX_PACKET: u32 = 32768;
const DEFAULT_WRITER_QUEUE_DEPTH: usize = 2048;

/// Governs whether a [`crate::File`] trusts a previously observed size or re-issues
/// `FSTAT` before trusting `EOF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatStrategy {
    /// Always issue a fresh `FSTAT` before trusting a size-dependent decision.
    AlwaysStat,
    /// Never stat; trust whatever the server returns from reads and nothing else.
    NeverStat,
    /// Stat once, lazily, and reuse the cached size for the life of the handle.
    #[default]
    Cached,
}

/// Runtime knobs for an [`crate::SftpClient`] connection.
///
/// Built with [`ClientConfigBuilder`]; `ClientConfig::builder()` is the entry point.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) max_packet: u32,
    pub(crate) prevent_slow_read_from: bool,
    pub(crate) stat_strategy: StatStrategy,
    pub(crate) writer_queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_packet: DEFAULT_MAX_PACKET,
            prevent_slow_read_from: false,
            stat_strategy: StatStrategy::default(),
            writer_queue_depth: DEFAULT_WRITER_QUEUE_DEPTH,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn max_packet(&self) -> u32 {
        self.max_packet
    }

    pub fn stat_strategy(&self) -> StatStrategy {
        self.stat_strategy
    }

    pub fn prevent_slow_read_from(&self) -> bool {
        self.prevent_slow_read_from
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Largest SFTP frame (length-prefix included) this client will send or accept.
    /// Clamped to at least [`MIN_MAX_PACKET`].
    pub fn max_packet(mut self, max_packet: u32) -> Self {
        self.config.max_packet = max_packet.max(MIN_MAX_PACKET);
        self
    }

    /// When set, [`crate::File::write_from`] refuses a source whose length it
    /// cannot discover up front rather than streaming it with an unbounded
    /// read-ahead window.
    pub fn prevent_slow_read_from(mut self, enabled: bool) -> Self {
        self.config.prevent_slow_read_from = enabled;
        self
    }

    pub fn stat_strategy(mut self, strategy: StatStrategy) -> Self {
        self.config.stat_strategy = strategy;
        self
    }

    /// Bound on in-flight requests queued to the writer task before `send` starts
    /// exerting backpressure on callers.
    pub fn writer_queue_depth(mut self, depth: usize) -> Self {
        self.config.writer_queue_depth = depth.max(1);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

pub(crate) type ErrorHook = Arc<dyn Fn(&crate::Error) + Send + Sync>;
