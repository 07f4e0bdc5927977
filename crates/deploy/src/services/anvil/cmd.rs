//! Anvil arguments for fork mode.

/// Builds the argument list for `anvil --fork-url ...`.
///
/// Anvil listens on all interfaces inside the container and mines on every
/// transaction, so rehearsed deployments confirm as soon as they are sent.
#[derive(Debug, Clone)]
pub struct AnvilCmdBuilder {
    port: u16,
    chain_id: u64,
    fork_url: String,
    fork_block_number: Option<u64>,
    extra_args: Vec<String>,
}

impl AnvilCmdBuilder {
    pub fn new(chain_id: u64, fork_url: impl Into<String>) -> Self {
        Self {
            port: 8545,
            chain_id,
            fork_url: fork_url.into(),
            fork_block_number: None,
            extra_args: Vec::new(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Pin the fork to a block instead of the upstream head.
    pub fn fork_block_number(mut self, block_number: Option<u64>) -> Self {
        self.fork_block_number = block_number;
        self
    }

    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Vec<String> {
        let mut args: Vec<String> = [
            ("--host", "0.0.0.0".to_string()),
            ("--port", self.port.to_string()),
            ("--chain-id", self.chain_id.to_string()),
            ("--fork-url", self.fork_url),
        ]
        .into_iter()
        .flat_map(|(flag, value)| [flag.to_string(), value])
        .collect();

        if let Some(block) = self.fork_block_number {
            args.extend(["--fork-block-number".to_string(), block.to_string()]);
        }
        args.extend(self.extra_args);
        args
    }
}
