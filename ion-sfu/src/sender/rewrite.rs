use crate::buffer::seq_is_newer;
use webrtc::rtp::header::Header;

/// Maps source sequence numbers and timestamps onto a subscriber's
/// outbound numbering.
///
/// The first packet passes through unchanged. After [`resync`](Self::resync)
/// the next packet is placed directly after the last forwarded one, so a
/// source change (simulcast switch, republish) looks continuous to the
/// decoder.
#[derive(Debug, Default)]
pub struct SequenceRewriter {
    seq_offset: u16,
    ts_offset: u32,
    last: Option<(u16, u32)>,
    /// First source sequence number forwarded with the current offset
    anchor: u16,
    resync: bool,
}

impl SequenceRewriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebase on the next live packet
    pub fn resync(&mut self) {
        self.resync = true;
    }

    /// Rewrite a live packet header in place
    pub fn rewrite(&mut self, header: &mut Header) {
        match self.last {
            None => {
                self.seq_offset = 0;
                self.ts_offset = 0;
                self.anchor = header.sequence_number;
                self.resync = false;
            }
            Some((last_seq, last_ts)) if self.resync => {
                self.seq_offset = header.sequence_number.wrapping_sub(last_seq.wrapping_add(1));
                self.ts_offset = header.timestamp.wrapping_sub(last_ts.wrapping_add(1));
                self.anchor = header.sequence_number;
                self.resync = false;
            }
            Some(_) => {}
        }

        let (seq, ts) = self.map(header.sequence_number, header.timestamp);
        let advance = match self.last {
            None => true,
            Some((last_seq, _)) => seq_is_newer(seq, last_seq),
        };
        if advance {
            self.last = Some((seq, ts));
        }
        header.sequence_number = seq;
        header.timestamp = ts;
    }

    /// Map a source sequence number and timestamp without advancing state
    #[must_use]
    pub const fn map(&self, sequence_number: u16, timestamp: u32) -> (u16, u32) {
        (
            sequence_number.wrapping_sub(self.seq_offset),
            timestamp.wrapping_sub(self.ts_offset),
        )
    }

    /// Source sequence number for an outbound one, if it was forwarded with
    /// the current offset
    #[must_use]
    pub fn source_sequence(&self, outbound: u16) -> Option<u16> {
        let (last_seq, _) = self.last?;
        let anchor_out = self.anchor.wrapping_sub(self.seq_offset);
        let after_anchor = outbound == anchor_out || seq_is_newer(outbound, anchor_out);
        let not_future = !seq_is_newer(outbound, last_seq);
        (after_anchor && not_future).then(|| outbound.wrapping_add(self.seq_offset))
    }

    /// Last outbound sequence number
    #[must_use]
    pub fn last_sequence(&self) -> Option<u16> {
        self.last.map(|(seq, _)| seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u16, ts: u32) -> Header {
        Header {
            sequence_number: seq,
            timestamp: ts,
            ..Default::default()
        }
    }

    fn rewrite(rw: &mut SequenceRewriter, seq: u16, ts: u32) -> (u16, u32) {
        let mut h = header(seq, ts);
        rw.rewrite(&mut h);
        (h.sequence_number, h.timestamp)
    }

    #[test]
    fn test_passthrough_until_resync() {
        let mut rw = SequenceRewriter::new();
        assert_eq!(rewrite(&mut rw, 1000, 90_000), (1000, 90_000));
        assert_eq!(rewrite(&mut rw, 1001, 93_000), (1001, 93_000));
        assert_eq!(rw.last_sequence(), Some(1001));
    }

    #[test]
    fn test_resync_continues_numbering() {
        let mut rw = SequenceRewriter::new();
        rewrite(&mut rw, 1000, 90_000);
        rewrite(&mut rw, 1001, 93_000);

        rw.resync();
        assert_eq!(rewrite(&mut rw, 5000, 1_000_000), (1002, 93_001));
        assert_eq!(rewrite(&mut rw, 5001, 1_003_000), (1003, 96_001));
    }

    #[test]
    fn test_resync_across_wrap() {
        let mut rw = SequenceRewriter::new();
        rewrite(&mut rw, 65535, 10);
        rw.resync();
        assert_eq!(rewrite(&mut rw, 300, 5000).0, 0);
        assert_eq!(rewrite(&mut rw, 301, 6000).0, 1);
    }

    #[test]
    fn test_out_of_order_does_not_regress() {
        let mut rw = SequenceRewriter::new();
        rewrite(&mut rw, 10, 0);
        rewrite(&mut rw, 12, 0);
        assert_eq!(rewrite(&mut rw, 11, 0).0, 11);
        assert_eq!(rw.last_sequence(), Some(12));
    }

    #[test]
    fn test_source_sequence() {
        let mut rw = SequenceRewriter::new();
        rewrite(&mut rw, 100, 0);
        rewrite(&mut rw, 101, 0);
        rw.resync();
        rewrite(&mut rw, 7000, 0);
        rewrite(&mut rw, 7001, 0);

        // 102, 103 were forwarded from 7000, 7001
        assert_eq!(rw.source_sequence(102), Some(7000));
        assert_eq!(rw.source_sequence(103), Some(7001));
        // before the switch
        assert_eq!(rw.source_sequence(101), None);
        // not forwarded yet
        assert_eq!(rw.source_sequence(104), None);
    }
}
