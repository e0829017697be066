//! Incremental Ogg container parser extracting raw Opus packets.
//!
//! Pages arrive in arbitrary chunks from a streaming TTS backend; the
//! parser buffers until a full page is available, skips the OpusHead /
//! OpusTags header pages (granule position 0), and splits payloads into
//! packets using the segment table. Feeding the same bytes in any chunking
//! yields the same packet sequence.

use tracing::debug;

const OGG_MAGIC: &[u8; 4] = b"OggS";
/// Fixed header size before the segment table.
const OGG_HEADER_SIZE: usize = 27;

#[derive(Debug, Default)]
pub struct OggOpusParser {
    buffer: Vec<u8>,
    header_pages_skipped: usize,
    total_packets: usize,
}

impl OggOpusParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every Opus packet completed by this chunk.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut packets = Vec::new();

        while self.buffer.len() >= OGG_HEADER_SIZE {
            if &self.buffer[..4] != OGG_MAGIC {
                // Resync on the next OggS marker; keep a 3-byte tail in
                // case the magic straddles the chunk boundary.
                match find_subsequence(&self.buffer[1..], OGG_MAGIC) {
                    Some(idx) => {
                        let skipped = idx + 1;
                        debug!(skipped, "ogg parser resync");
                        self.buffer.drain(..skipped);
                        continue;
                    }
                    None => {
                        let keep = self.buffer.len().min(3);
                        let tail = self.buffer.split_off(self.buffer.len() - keep);
                        self.buffer = tail;
                        break;
                    }
                }
            }

            let num_segments = self.buffer[26] as usize;
            let header_total = OGG_HEADER_SIZE + num_segments;
            if self.buffer.len() < header_total {
                break;
            }

            let segment_table: Vec<u8> = self.buffer[OGG_HEADER_SIZE..header_total].to_vec();
            let payload_size: usize = segment_table.iter().map(|&s| s as usize).sum();
            let page_size = header_total + payload_size;
            if self.buffer.len() < page_size {
                break;
            }

            let granule = u64::from_le_bytes(self.buffer[6..14].try_into().unwrap());
            let payload = &self.buffer[header_total..page_size];

            // OpusHead and OpusTags pages carry granule position 0.
            if granule == 0 {
                self.header_pages_skipped += 1;
            } else {
                packets.extend(Self::split_packets(payload, &segment_table));
            }

            self.buffer.drain(..page_size);
        }

        self.total_packets += packets.len();
        packets
    }

    /// Split a page payload into packets using the segment table: segments
    /// of 255 continue the packet, anything shorter terminates it.
    fn split_packets(payload: &[u8], segment_table: &[u8]) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut current = Vec::new();
        let mut offset = 0usize;

        for &segment_size in segment_table {
            let size = segment_size as usize;
            current.extend_from_slice(&payload[offset..offset + size]);
            offset += size;
            if size < 255 && !current.is_empty() {
                packets.push(std::mem::take(&mut current));
            }
        }

        // A trailing 255 segment means the packet continues on the next
        // page; for streaming we still emit it rather than stall.
        if !current.is_empty() {
            packets.push(current);
        }
        packets
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.header_pages_skipped = 0;
        self.total_packets = 0;
    }

    pub fn total_packets(&self) -> usize {
        self.total_packets
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
