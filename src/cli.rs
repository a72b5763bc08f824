//! Command line interface for the demo broker binary.

use clap::Parser;

/// Command line arguments for the `amqwire` demo broker.
#[derive(Debug, Parser)]
#[command(name = "amqwire", version, about = "Demo broker for the amqwire engine")]
pub struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:5672")]
    pub listen: String,

    /// Maximum frame size advertised to clients, in bytes.
    #[arg(long, default_value_t = 65_536)]
    pub max_frame_size: u32,

    /// Producer flow-control rate in messages per second (0 disables).
    #[arg(long, default_value_t = 0)]
    pub max_session_rate: u32,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn parses_listen_address() {
        let cli = Cli::parse_from(["amqwire", "--listen", "0.0.0.0:9999"]);
        assert_eq!(cli.listen, "0.0.0.0:9999");
        assert_eq!(cli.max_session_rate, 0);
    }
}
