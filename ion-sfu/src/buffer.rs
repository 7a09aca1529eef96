//! Retention buffer for recently received RTP packets

use webrtc::rtp::packet::Packet;

/// `a` is newer than `b` in 16-bit sequence space
#[must_use]
pub const fn seq_is_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Ring buffer of packets indexed by `sequence_number % capacity`.
///
/// Capacity is a power of two so the index stays consistent across the
/// 16-bit sequence wrap. A slot is only returned if it still holds exactly
/// the requested sequence number and that number is within the window
/// behind the highest sequence seen.
pub struct PacketBuffer {
    slots: Vec<Option<Packet>>,
    mask: usize,
    highest_sequence: Option<u16>,
    highest_timestamp: u32,
}

impl PacketBuffer {
    /// `capacity` must be a power of two no larger than 32768
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity <= 32768);
        Self {
            slots: vec![None; capacity],
            mask: capacity - 1,
            highest_sequence: None,
            highest_timestamp: 0,
        }
    }

    /// Store a packet, evicting whatever occupied its slot
    pub fn push(&mut self, packet: Packet) {
        let seq = packet.header.sequence_number;
        match self.highest_sequence {
            Some(highest) if !seq_is_newer(seq, highest) => {}
            _ => {
                self.highest_sequence = Some(seq);
                self.highest_timestamp = packet.header.timestamp;
            }
        }
        let index = usize::from(seq) & self.mask;
        self.slots[index] = Some(packet);
    }

    /// Look up a retained packet
    #[must_use]
    pub fn get(&self, sequence_number: u16) -> Option<&Packet> {
        let highest = self.highest_sequence?;
        let age = usize::from(highest.wrapping_sub(sequence_number));
        if age >= self.slots.len() {
            return None;
        }
        self.slots[usize::from(sequence_number) & self.mask]
            .as_ref()
            .filter(|p| p.header.sequence_number == sequence_number)
    }

    #[must_use]
    pub const fn highest_sequence(&self) -> Option<u16> {
        self.highest_sequence
    }

    #[must_use]
    pub const fn highest_timestamp(&self) -> u32 {
        self.highest_timestamp
    }

    /// Drop all retained packets
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.highest_sequence = None;
        self.highest_timestamp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use webrtc::rtp::header::Header;

    fn packet(seq: u16, ts: u32) -> Packet {
        Packet {
            header: Header {
                sequence_number: seq,
                timestamp: ts,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xAB]),
        }
    }

    #[test]
    fn test_seq_is_newer() {
        assert!(seq_is_newer(2, 1));
        assert!(!seq_is_newer(1, 2));
        assert!(!seq_is_newer(5, 5));
        assert!(seq_is_newer(0, 65535));
        assert!(!seq_is_newer(65535, 0));
    }

    #[test]
    fn test_retains_recent_packets() {
        let mut buffer = PacketBuffer::new(16);
        for seq in 100..110 {
            buffer.push(packet(seq, u32::from(seq) * 10));
        }
        assert_eq!(buffer.highest_sequence(), Some(109));
        assert_eq!(buffer.highest_timestamp(), 1090);
        assert!(buffer.get(105).is_some());
        assert!(buffer.get(110).is_none());
        assert!(buffer.get(50).is_none());
    }

    #[test]
    fn test_evicts_oldest() {
        let mut buffer = PacketBuffer::new(8);
        for seq in 0..20 {
            buffer.push(packet(seq, 0));
        }
        assert!(buffer.get(11).is_none());
        assert!(buffer.get(12).is_some());
        assert!(buffer.get(19).is_some());
    }

    #[test]
    fn test_wraparound() {
        let mut buffer = PacketBuffer::new(8);
        for seq in [65533u16, 65534, 65535, 0, 1] {
            buffer.push(packet(seq, 0));
        }
        assert_eq!(buffer.highest_sequence(), Some(1));
        assert!(buffer.get(65534).is_some());
        assert!(buffer.get(0).is_some());
    }

    #[test]
    fn test_late_packet_does_not_move_highest() {
        let mut buffer = PacketBuffer::new(8);
        buffer.push(packet(10, 1000));
        buffer.push(packet(8, 800));
        assert_eq!(buffer.highest_sequence(), Some(10));
        assert_eq!(buffer.highest_timestamp(), 1000);
        assert!(buffer.get(8).is_some());
    }

    #[test]
    fn test_clear() {
        let mut buffer = PacketBuffer::new(8);
        buffer.push(packet(1, 0));
        buffer.clear();
        assert!(buffer.get(1).is_none());
        assert_eq!(buffer.highest_sequence(), None);
    }
}
