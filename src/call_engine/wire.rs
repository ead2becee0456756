//! Datagram wire format
//!
//! Two formats are supported:
//! - `Sentinel`: payloads carry no header. A payload equal to `END_CALL`
//!   is a hang-up, everything else is raw PCM16. Audio that happens to be
//!   byte-identical to the sentinel is read as a hang-up.
//! - `Tagged`: every payload starts with one type byte
//!   (`0x00` audio, `0x01` end-call). Both peers must use it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// In-band hang-up marker of the sentinel format
pub const END_CALL_SENTINEL: &[u8; 8] = b"END_CALL";

/// Type byte for audio payloads (tagged format)
pub const TAG_AUDIO: u8 = 0x00;

/// Type byte for the hang-up message (tagged format)
pub const TAG_END_CALL: u8 = 0x01;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    #[default]
    Sentinel,
    Tagged,
}

/// A classified inbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    Audio(&'a [u8]),
    EndCall,
    /// Tagged payload with an unknown or missing type byte
    Unknown,
}

impl WireFormat {
    /// Bytes added in front of each audio payload
    pub fn header_len(self) -> usize {
        match self {
            WireFormat::Sentinel => 0,
            WireFormat::Tagged => 1,
        }
    }

    /// Receive buffer needed for frames of `buffer_size` bytes.
    ///
    /// Never smaller than the hang-up datagram, or it would arrive truncated.
    pub fn datagram_capacity(self, buffer_size: usize) -> usize {
        let end_call_len = match self {
            WireFormat::Sentinel => END_CALL_SENTINEL.len(),
            WireFormat::Tagged => 1,
        };
        (buffer_size + self.header_len()).max(end_call_len)
    }

    /// Writes the audio datagram for `audio` into `out`, replacing its content
    pub fn encode_audio_into(self, audio: &[u8], out: &mut Vec<u8>) {
        out.clear();
        if self == WireFormat::Tagged {
            out.push(TAG_AUDIO);
        }
        out.extend_from_slice(audio);
    }

    /// The hang-up datagram
    pub fn end_call_datagram(self) -> Vec<u8> {
        match self {
            WireFormat::Sentinel => END_CALL_SENTINEL.to_vec(),
            WireFormat::Tagged => vec![TAG_END_CALL],
        }
    }

    /// Classifies a received payload (already trimmed to the received length)
    pub fn classify(self, payload: &[u8]) -> Packet<'_> {
        match self {
            WireFormat::Sentinel => {
                // Exact, case-sensitive match only.
                if payload == END_CALL_SENTINEL {
                    Packet::EndCall
                } else {
                    Packet::Audio(payload)
                }
            }
            WireFormat::Tagged => match payload.split_first() {
                Some((&TAG_AUDIO, audio)) => Packet::Audio(audio),
                Some((&TAG_END_CALL, _)) => Packet::EndCall,
                _ => Packet::Unknown,
            },
        }
    }

    /// True when an outgoing audio frame would be read as a hang-up by the peer
    pub fn collides_with_sentinel(self, audio: &[u8]) -> bool {
        self == WireFormat::Sentinel && audio == END_CALL_SENTINEL
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Sentinel => f.write_str("sentinel"),
            WireFormat::Tagged => f.write_str("tagged"),
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sentinel" => Ok(WireFormat::Sentinel),
            "tagged" => Ok(WireFormat::Tagged),
            other => Err(format!("unknown wire format '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_is_end_call() {
        assert_eq!(
            WireFormat::Sentinel.classify(b"END_CALL"),
            Packet::EndCall
        );
    }

    #[test]
    fn test_sentinel_match_is_case_sensitive() {
        assert_eq!(
            WireFormat::Sentinel.classify(b"end_call"),
            Packet::Audio(b"end_call")
        );
        assert_eq!(
            WireFormat::Sentinel.classify(b"End_Call"),
            Packet::Audio(b"End_Call")
        );
    }

    #[test]
    fn test_sentinel_prefix_is_audio() {
        let payload = b"END_CALL\0\0";
        assert_eq!(
            WireFormat::Sentinel.classify(payload),
            Packet::Audio(&payload[..])
        );
        assert_eq!(
            WireFormat::Sentinel.classify(b"END_CAL"),
            Packet::Audio(b"END_CAL")
        );
    }

    #[test]
    fn test_colliding_audio_reads_as_end_call() {
        // PCM samples 0x4E45, 0x5F44, 0x4143, 0x4C4C spell the sentinel.
        let samples: [i16; 4] = [0x4E45, 0x5F44, 0x4143, 0x4C4C];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(bytes.as_slice(), END_CALL_SENTINEL);

        assert!(WireFormat::Sentinel.collides_with_sentinel(&bytes));
        assert_eq!(WireFormat::Sentinel.classify(&bytes), Packet::EndCall);

        // The tagged format carries the same bytes as audio.
        let mut datagram = Vec::new();
        WireFormat::Tagged.encode_audio_into(&bytes, &mut datagram);
        assert!(!WireFormat::Tagged.collides_with_sentinel(&bytes));
        assert_eq!(
            WireFormat::Tagged.classify(&datagram),
            Packet::Audio(&bytes[..])
        );
    }

    #[test]
    fn test_tagged_format() {
        let mut datagram = Vec::new();
        WireFormat::Tagged.encode_audio_into(&[1, 2, 3], &mut datagram);
        assert_eq!(datagram, vec![TAG_AUDIO, 1, 2, 3]);

        let end = WireFormat::Tagged.end_call_datagram();
        assert_eq!(WireFormat::Tagged.classify(&end), Packet::EndCall);

        assert_eq!(WireFormat::Tagged.classify(&[]), Packet::Unknown);
        assert_eq!(WireFormat::Tagged.classify(&[0x7F, 1]), Packet::Unknown);
        assert_eq!(WireFormat::Tagged.datagram_capacity(4096), 4097);
        assert_eq!(WireFormat::Sentinel.datagram_capacity(4), 8);
        assert_eq!(WireFormat::Sentinel.datagram_capacity(4096), 4096);
    }

    #[test]
    fn test_parse_wire_format() {
        assert_eq!("tagged".parse::<WireFormat>(), Ok(WireFormat::Tagged));
        assert_eq!(" Sentinel ".parse::<WireFormat>(), Ok(WireFormat::Sentinel));
        assert!("json".parse::<WireFormat>().is_err());
        assert_eq!(WireFormat::Tagged.to_string(), "tagged");
    }
}
