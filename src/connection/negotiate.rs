//! Tune negotiation rules.
//!
//! The server advertises its caps in `connection.tune`; the client replies
//! with `connection.tune-ok`. A client value of zero means "server cap",
//! every other value is clamped to the server's limit.

/// Smallest frame size a peer may negotiate.
pub const MIN_FRAME_SIZE: u32 = 4096;

/// Hard protocol ceiling on channel ids.
pub const MAX_CHANNEL_MAX: u16 = 0xFFFF;

/// Server-side caps advertised during tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerLimits {
    /// Most channels a connection may open.
    pub channel_max: u16,
    /// Largest frame the server accepts, in bytes.
    pub max_frame_size: u32,
    /// Largest heartbeat interval the server grants, in seconds.
    pub heartbeat_max: u16,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            channel_max: MAX_CHANNEL_MAX,
            max_frame_size: 65_536,
            heartbeat_max: 120,
        }
    }
}

/// Values agreed between the peers after `connection.tune-ok`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tuning {
    /// Agreed channel-id ceiling.
    pub channel_max: u16,
    /// Agreed maximum frame size in bytes.
    pub max_frame_size: u32,
    /// Agreed heartbeat interval in seconds; zero disables heartbeats.
    pub heartbeat: u16,
}

/// Apply the negotiation rules to the client's `tune-ok` values.
#[must_use]
pub fn negotiate(
    limits: ServerLimits,
    channel_max: u16,
    max_frame_size: u32,
    heartbeat: u16,
) -> Tuning {
    let channel_max = if channel_max == 0 {
        limits.channel_max
    } else {
        channel_max.min(limits.channel_max)
    };
    let max_frame_size = if max_frame_size == 0 {
        limits.max_frame_size
    } else {
        max_frame_size.clamp(MIN_FRAME_SIZE, limits.max_frame_size)
    };
    Tuning {
        channel_max,
        max_frame_size,
        heartbeat: heartbeat.min(limits.heartbeat_max),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, MAX_CHANNEL_MAX)]
    #[case(1, 1)]
    #[case(MAX_CHANNEL_MAX, MAX_CHANNEL_MAX)]
    fn zero_channel_max_means_server_cap(#[case] requested: u16, #[case] agreed: u16) {
        let tuning = negotiate(ServerLimits::default(), requested, 0, 0);
        assert_eq!(tuning.channel_max, agreed);
    }

    #[rstest]
    #[case(0, 65_536)]
    #[case(1, MIN_FRAME_SIZE)]
    #[case(1 << 20, 65_536)]
    #[case(16_384, 16_384)]
    fn frame_size_is_bounded(#[case] requested: u32, #[case] agreed: u32) {
        let tuning = negotiate(ServerLimits::default(), 0, requested, 0);
        assert_eq!(tuning.max_frame_size, agreed);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(30, 30)]
    #[case(600, 120)]
    fn heartbeat_takes_the_smaller_value(#[case] requested: u16, #[case] agreed: u16) {
        let tuning = negotiate(ServerLimits::default(), 0, 0, requested);
        assert_eq!(tuning.heartbeat, agreed);
    }
}
