use bincode::config::Configuration;
use bincode::{Decode, Encode};
use riffle_types::{Result, WatermarkError};

pub mod timers;

pub use timers::{Timer, TimerContext, TimerService, TimerSnapshot};

pub const BINCODE_CONFIG: Configuration = bincode::config::standard();

/// Serializes a checkpoint snapshot for the checkpoint coordinator.
pub fn encode_snapshot<S: Encode>(snapshot: &S) -> Result<Vec<u8>> {
    bincode::encode_to_vec(snapshot, BINCODE_CONFIG)
        .map_err(|e| WatermarkError::Snapshot(e.to_string()))
}

/// Deserializes a snapshot produced by [`encode_snapshot`]; trailing bytes are
/// treated as corruption.
pub fn decode_snapshot<S: Decode>(bytes: &[u8]) -> Result<S> {
    let (snapshot, len) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)
        .map_err(|e| WatermarkError::Snapshot(e.to_string()))?;

    if len != bytes.len() {
        return Err(WatermarkError::Snapshot(format!(
            "snapshot has {} trailing bytes",
            bytes.len() - len
        )));
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use riffle_types::{from_millis, CallbackId};

    #[test]
    fn test_timer_snapshot_codec() {
        let mut timers: TimerService<String> = TimerService::new();
        timers.register(from_millis(10), "a".to_string(), CallbackId(1));
        timers.register(from_millis(5), "b".to_string(), CallbackId(2));

        let bytes = encode_snapshot(&timers.snapshot()).unwrap();
        let decoded: TimerSnapshot<String> = decode_snapshot(&bytes).unwrap();

        assert_eq!(TimerService::restore(decoded).pending(), timers.pending());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_snapshot(&42u64).unwrap();
        bytes.push(0);

        let result: Result<u64> = decode_snapshot(&bytes);
        assert!(matches!(result, Err(WatermarkError::Snapshot(_))));
    }
}
