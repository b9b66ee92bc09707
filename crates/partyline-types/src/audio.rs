//! Voice recordings carried as message attachments.
//!
//! A [`Recording`] is an ordered list of Opus packets. The capture and
//! playback pipelines live outside the core; this module only fixes the
//! attachment payload format and the checks both sides agree on.

use serde::{Deserialize, Serialize};

use crate::{PartyLineError, Result};

/// Largest Opus packet allowed by RFC 6716.
pub const MAX_OPUS_PACKET_SIZE: usize = 1275;

/// Frame durations Opus can encode, in half-milliseconds
/// (2.5, 5, 10, 20, 40 and 60 ms).
const VALID_FRAME_HALF_MS: [u64; 6] = [5, 10, 20, 40, 80, 120];

/// An audio recording: an id and its Opus frames in playback order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Identifier shared with the [`Attachment`](crate::Attachment) that
    /// references this recording.
    pub id: String,
    /// Encoded Opus packets.
    pub frames: Vec<Vec<u8>>,
}

impl Recording {
    /// Creates a recording.
    pub fn new(id: impl Into<String>, frames: Vec<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            frames,
        }
    }

    /// Checks every frame against the Opus packet limits.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for an empty frame or a frame larger
    /// than [`MAX_OPUS_PACKET_SIZE`].
    pub fn validate(&self) -> Result<()> {
        for (index, frame) in self.frames.iter().enumerate() {
            if frame.is_empty() {
                return Err(PartyLineError::ProtocolViolation {
                    reason: format!("recording {}: frame {index} is empty", self.id),
                });
            }
            if frame.len() > MAX_OPUS_PACKET_SIZE {
                return Err(PartyLineError::ProtocolViolation {
                    reason: format!(
                        "recording {}: frame {index} is {} bytes (max {MAX_OPUS_PACKET_SIZE})",
                        self.id,
                        frame.len()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Total encoded size of all frames.
    pub fn encoded_len(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    /// Serializes the recording into an attachment payload (CBOR).
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if a frame is invalid or encoding fails.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut buf = Vec::with_capacity(self.encoded_len() + 64);
        ciborium::into_writer(self, &mut buf).map_err(|e| PartyLineError::ProtocolViolation {
            reason: format!("recording encode failed: {e}"),
        })?;
        Ok(buf)
    }

    /// Decodes an attachment payload produced by [`Recording::to_payload`].
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the bytes are not a valid recording
    /// or a frame breaks the Opus packet limits.
    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        let recording: Self =
            ciborium::from_reader(bytes).map_err(|e| PartyLineError::ProtocolViolation {
                reason: format!("recording decode failed: {e}"),
            })?;
        recording.validate()?;
        Ok(recording)
    }
}

/// Checks that a mono PCM chunk of `samples` at `sample_rate` Hz spans a
/// duration Opus can encode.
///
/// # Errors
///
/// Returns `ProtocolViolation` for a zero sample rate or any duration other
/// than 2.5, 5, 10, 20, 40 or 60 ms.
pub fn validate_frame_duration(samples: usize, sample_rate: u32) -> Result<()> {
    if sample_rate == 0 {
        return Err(PartyLineError::ProtocolViolation {
            reason: "sample rate must be non-zero".into(),
        });
    }
    let scaled = samples as u64 * 2000;
    let rate = u64::from(sample_rate);
    let ok = VALID_FRAME_HALF_MS.iter().any(|&half_ms| half_ms * rate == scaled);
    if ok {
        Ok(())
    } else {
        Err(PartyLineError::ProtocolViolation {
            reason: format!(
                "illegal frame size: {samples} samples ({:.3} ms at {sample_rate} Hz)",
                samples as f64 * 1000.0 / f64::from(sample_rate)
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip_preserves_frames() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let rec = Recording::new("rec-1", vec![vec![1, 2, 3], vec![0xff; MAX_OPUS_PACKET_SIZE]]);
        let decoded = Recording::from_payload(&rec.to_payload()?)?;
        assert_eq!(decoded, rec);
        Ok(())
    }

    #[test]
    fn empty_recording_is_valid() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let rec = Recording::new("silence", Vec::new());
        assert_eq!(Recording::from_payload(&rec.to_payload()?)?.frames.len(), 0);
        Ok(())
    }

    #[test]
    fn oversized_frame_rejected() {
        let rec = Recording::new("big", vec![vec![0; MAX_OPUS_PACKET_SIZE + 1]]);
        assert!(matches!(
            rec.to_payload(),
            Err(PartyLineError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn empty_frame_rejected() {
        let rec = Recording::new("hole", vec![vec![1], Vec::new()]);
        assert!(matches!(
            rec.validate(),
            Err(PartyLineError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn garbage_payload_rejected() {
        assert!(matches!(
            Recording::from_payload(b"not cbor at all"),
            Err(PartyLineError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn opus_frame_durations_at_48k() {
        for samples in [120, 240, 480, 960, 1920, 2880] {
            assert!(validate_frame_duration(samples, 48_000).is_ok(), "{samples}");
        }
    }

    #[test]
    fn illegal_frame_durations_rejected() {
        for samples in [0, 100, 481, 4800] {
            assert!(validate_frame_duration(samples, 48_000).is_err(), "{samples}");
        }
        assert!(validate_frame_duration(960, 0).is_err());
    }

    #[test]
    fn frame_duration_at_other_rates() {
        // 20 ms at 16 kHz
        assert!(validate_frame_duration(320, 16_000).is_ok());
        // 2.5 ms at 8 kHz
        assert!(validate_frame_duration(20, 8_000).is_ok());
    }
}
