//! Directory entries: 32-byte short (8.3) entries and the chained long
//! filename entries that precede them.

use tracing::trace;

/// Size of every directory entry slot on disk.
pub const ENTRY_SIZE: usize = 32;

/// First byte of a slot that was deleted.
pub const FREE_MARK: u8 = 0xE5;
/// First byte of the slot terminating the directory: nothing follows.
pub const END_MARK: u8 = 0x00;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
/// Read-only | hidden | system | volume id: the pattern that marks a long
/// filename entry.
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// UTF-16 code units carried per long filename entry.
const LFN_CHARS_PER_ENTRY: usize = 13;
/// Sequence-number bit marking the final (highest) entry of an LFN run.
const LFN_LAST_FLAG: u8 = 0x40;

/// A short (8.3) directory entry, kept in its raw on-disk form with typed
/// accessors over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortEntry {
    raw: [u8; ENTRY_SIZE],
}

impl ShortEntry {
    pub fn from_raw(raw: [u8; ENTRY_SIZE]) -> Self {
        Self { raw }
    }

    /// Builds a fresh entry. `name` must already be in padded 8.3 form.
    pub fn new(name: [u8; 11], attributes: u8, first_cluster: u32, file_size: u32) -> Self {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0..11].copy_from_slice(&name);
        raw[11] = attributes;
        raw[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
        raw[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
        raw[28..32].copy_from_slice(&file_size.to_le_bytes());
        Self { raw }
    }

    pub fn raw(&self) -> &[u8; ENTRY_SIZE] {
        &self.raw
    }

    pub fn name_bytes(&self) -> [u8; 11] {
        self.raw[0..11].try_into().unwrap()
    }

    pub fn attributes(&self) -> u8 {
        self.raw[11]
    }

    pub fn is_directory(&self) -> bool {
        self.attributes() & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes() & ATTR_VOLUME_ID != 0
    }

    /// The first cluster is split across two 16-bit little-endian slots:
    /// the high word at offset 20 (a FAT32 addition), the low word at
    /// offset 26 where FAT12/16 kept the whole field.
    pub fn first_cluster(&self) -> u32 {
        let high = u16::from_le_bytes([self.raw[20], self.raw[21]]) as u32;
        let low = u16::from_le_bytes([self.raw[26], self.raw[27]]) as u32;
        (high << 16) | low
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.raw[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        self.raw[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    }

    pub fn file_size(&self) -> u32 {
        u32::from_le_bytes([self.raw[28], self.raw[29], self.raw[30], self.raw[31]])
    }

    pub fn set_file_size(&mut self, size: u32) {
        self.raw[28..32].copy_from_slice(&size.to_le_bytes());
    }

    /// "NAME    EXT" rendered as "NAME.EXT".
    pub fn short_name(&self) -> String {
        let base: String = String::from_utf8_lossy(&self.raw[0..8]).trim_end().to_string();
        let ext: String = String::from_utf8_lossy(&self.raw[8..11]).trim_end().to_string();
        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }
}

/// Checksum over the 11 bytes of an 8.3 name, stored in every long filename
/// entry to tie the run to its short entry.
pub fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    short_name.iter().fold(0u8, |sum, &b| {
        ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b)
    })
}

/// One long filename entry: a fragment of up to 13 UTF-16 code units plus
/// the sequencing metadata linking it to the short entry that follows.
#[derive(Debug, Clone)]
struct LfnFragment {
    sequence: u8,
    checksum: u8,
    units: Vec<u16>,
}

impl LfnFragment {
    fn parse(raw: &[u8]) -> Self {
        // Name fragments live at 1..11, 14..26 and 28..32.
        let mut units = Vec::with_capacity(LFN_CHARS_PER_ENTRY);
        let ranges: [(usize, usize); 3] = [(1, 11), (14, 26), (28, 32)];
        for (start, end) in ranges {
            for chunk in raw[start..end].chunks_exact(2) {
                units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
            }
        }
        Self {
            sequence: raw[0] & !LFN_LAST_FLAG,
            checksum: raw[13],
            units,
        }
    }

    fn encode(sequence: u8, last: bool, checksum: u8, units: &[u16]) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = if last {
            sequence | LFN_LAST_FLAG
        } else {
            sequence
        };
        raw[11] = ATTR_LONG_NAME;
        raw[12] = 0; // type: name entry
        raw[13] = checksum;
        // raw[26..28] stays zero: LFN entries carry no cluster.
        let mut padded = [0xFFFFu16; LFN_CHARS_PER_ENTRY];
        padded[..units.len()].copy_from_slice(units);
        if units.len() < LFN_CHARS_PER_ENTRY {
            padded[units.len()] = 0x0000; // terminator before the 0xFFFF fill
        }
        let ranges: [(usize, usize); 3] = [(1, 11), (14, 26), (28, 32)];
        let mut unit = padded.iter();
        for (start, end) in ranges {
            for slot in raw[start..end].chunks_exact_mut(2) {
                slot.copy_from_slice(&unit.next().unwrap().to_le_bytes());
            }
        }
        raw
    }
}

/// A logical directory entry: the short entry plus the best name we can
/// give it (the long name when its run checks out, the 8.3 name otherwise).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub short: ShortEntry,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.short.is_directory()
    }

    pub fn first_cluster(&self) -> u32 {
        self.short.first_cluster()
    }

    pub fn file_size(&self) -> u32 {
        self.short.file_size()
    }
}

/// Parses a directory's raw byte stream (the concatenated contents of its
/// cluster chain) into logical entries, in on-disk order.
///
/// Long-name runs are stored highest-sequence-first; they are reassembled in
/// ascending sequence order and validated against the short entry's
/// checksum. A run that does not validate degrades to the 8.3 name instead
/// of failing: plenty of real volumes carry inconsistent runs left behind by
/// buggy writers.
pub fn parse_stream(stream: &[u8]) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut pending: Vec<LfnFragment> = Vec::new();

    for slot in stream.chunks_exact(ENTRY_SIZE) {
        match slot[0] {
            END_MARK => break,
            FREE_MARK => {
                pending.clear();
                continue;
            }
            _ => {}
        }
        if slot[11] & ATTR_LONG_NAME == ATTR_LONG_NAME {
            pending.push(LfnFragment::parse(slot));
            continue;
        }

        let short = ShortEntry::from_raw(slot.try_into().unwrap());
        let name = assemble_long_name(&mut pending, &short).unwrap_or_else(|| short.short_name());
        entries.push(DirEntry { name, short });
    }
    entries
}

/// Reassembles the accumulated LFN run for `short`, or returns `None` when
/// the run is absent, out of sequence, or fails the checksum.
fn assemble_long_name(pending: &mut Vec<LfnFragment>, short: &ShortEntry) -> Option<String> {
    let mut run = std::mem::take(pending);
    if run.is_empty() {
        return None;
    }
    let expected = lfn_checksum(&short.name_bytes());
    if run.iter().any(|f| f.checksum != expected) {
        trace!(name = %short.short_name(), "long name checksum mismatch, using 8.3 name");
        return None;
    }
    // Fragments arrive highest-sequence-first; the name reads in ascending
    // sequence order.
    run.sort_by_key(|f| f.sequence);
    if run
        .iter()
        .enumerate()
        .any(|(i, f)| f.sequence != i as u8 + 1)
    {
        trace!(name = %short.short_name(), "long name run out of sequence, using 8.3 name");
        return None;
    }
    let mut units: Vec<u16> = run.iter().flat_map(|f| f.units.iter().copied()).collect();
    if let Some(end) = units.iter().position(|&u| u == 0x0000) {
        units.truncate(end);
    }
    Some(String::from_utf16_lossy(&units))
}

/// Serializes a named entry as its long-name run (descending sequence, last
/// flag on the first slot written) followed by the short entry itself.
pub fn encode_entry(long_name: &str, short: &ShortEntry) -> Vec<u8> {
    let units: Vec<u16> = long_name.encode_utf16().collect();
    let checksum = lfn_checksum(&short.name_bytes());
    let fragment_count = units.len().div_ceil(LFN_CHARS_PER_ENTRY);

    let mut out = Vec::with_capacity((fragment_count + 1) * ENTRY_SIZE);
    for index in (0..fragment_count).rev() {
        let start = index * LFN_CHARS_PER_ENTRY;
        let end = (start + LFN_CHARS_PER_ENTRY).min(units.len());
        let raw = LfnFragment::encode(
            index as u8 + 1,
            index == fragment_count - 1,
            checksum,
            &units[start..end],
        );
        out.extend_from_slice(&raw);
    }
    out.extend_from_slice(short.raw());
    out
}

/// Pads a plain name into 8.3 form, uppercased, for a generated short entry.
pub fn to_short_name(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let upper = name.to_ascii_uppercase();
    let (base, ext) = match upper.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (upper.as_str(), ""),
    };
    for (i, b) in base.bytes().filter(|b| *b != b' ').take(8).enumerate() {
        out[i] = b;
    }
    for (i, b) in ext.bytes().filter(|b| *b != b' ').take(3).enumerate() {
        out[8 + i] = b;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_entry_cluster_words_combine() {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0..11].copy_from_slice(b"README  TXT");
        raw[20..22].copy_from_slice(&0x0012u16.to_le_bytes()); // high word
        raw[26..28].copy_from_slice(&0x3456u16.to_le_bytes()); // low word
        raw[28..32].copy_from_slice(&600u32.to_le_bytes());
        let entry = ShortEntry::from_raw(raw);
        assert_eq!(entry.first_cluster(), 0x0012_3456);
        assert_eq!(entry.file_size(), 600);
        assert_eq!(entry.short_name(), "README.TXT");
    }

    #[test]
    fn checksum_of_known_name() {
        assert_eq!(lfn_checksum(b"README  TXT"), 0x73);
    }

    #[test]
    fn long_name_round_trips_through_independent_paths() {
        let short = ShortEntry::new(to_short_name("photos of trip.jpeg"), ATTR_ARCHIVE, 9, 1234);
        let bytes = encode_entry("photos of trip.jpeg", &short);
        // Two LFN slots (19 chars) plus the short entry.
        assert_eq!(bytes.len(), 3 * ENTRY_SIZE);
        assert_eq!(bytes[0] & LFN_LAST_FLAG, LFN_LAST_FLAG);

        let mut stream = bytes.clone();
        stream.extend_from_slice(&[0u8; ENTRY_SIZE]); // end marker
        let entries = parse_stream(&stream);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "photos of trip.jpeg");
        assert_eq!(entries[0].first_cluster(), 9);
    }

    #[test]
    fn checksum_mismatch_falls_back_to_short_name() {
        let short = ShortEntry::new(to_short_name("hello.txt"), ATTR_ARCHIVE, 3, 10);
        let mut bytes = encode_entry("hello.txt", &short);
        bytes[13] ^= 0xFF; // corrupt the checksum of the first LFN slot
        bytes.extend_from_slice(&[0u8; ENTRY_SIZE]);
        let entries = parse_stream(&bytes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "HELLO.TXT");
    }

    #[test]
    fn deleted_slots_discard_the_pending_run() {
        let short = ShortEntry::new(to_short_name("a.txt"), ATTR_ARCHIVE, 3, 0);
        let mut bytes = encode_entry("a.txt", &short);
        // Delete the short entry; the orphaned LFN slot must not leak into
        // the next entry.
        let last = bytes.len() - ENTRY_SIZE;
        bytes[last] = FREE_MARK;
        let other = ShortEntry::new(to_short_name("b.txt"), ATTR_ARCHIVE, 4, 0);
        bytes.extend_from_slice(other.raw());
        bytes.extend_from_slice(&[0u8; ENTRY_SIZE]);
        let entries = parse_stream(&bytes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "B.TXT");
    }

    #[test]
    fn end_marker_stops_parsing() {
        let short = ShortEntry::new(to_short_name("x"), ATTR_ARCHIVE, 5, 0);
        let mut bytes = vec![0u8; ENTRY_SIZE]; // end marker first
        bytes.extend_from_slice(short.raw());
        assert!(parse_stream(&bytes).is_empty());
    }
}
