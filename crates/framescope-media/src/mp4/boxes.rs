//! MP4 box type codes and the box tree node.

use super::fields::BoxFields;

/// Four-character box type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const STYP: Self = Self(*b"styp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MOOF: Self = Self(*b"moof");
    pub const MDAT: Self = Self(*b"mdat");
    pub const FREE: Self = Self(*b"free");
    pub const SKIP: Self = Self(*b"skip");
    pub const WIDE: Self = Self(*b"wide");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const MVEX: Self = Self(*b"mvex");
    pub const TREX: Self = Self(*b"trex");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const EDTS: Self = Self(*b"edts");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const DINF: Self = Self(*b"dinf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const STTS: Self = Self(*b"stts");
    pub const STSS: Self = Self(*b"stss");
    pub const STSC: Self = Self(*b"stsc");
    pub const STSZ: Self = Self(*b"stsz");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");
    pub const CTTS: Self = Self(*b"ctts");
    pub const AVC1: Self = Self(*b"avc1");
    pub const AVC3: Self = Self(*b"avc3");
    pub const HEV1: Self = Self(*b"hev1");
    pub const HVC1: Self = Self(*b"hvc1");
    pub const ENCV: Self = Self(*b"encv");
    pub const MP4A: Self = Self(*b"mp4a");
    pub const ENCA: Self = Self(*b"enca");
    pub const AVCC: Self = Self(*b"avcC");
    pub const HVCC: Self = Self(*b"hvcC");
    pub const ESDS: Self = Self(*b"esds");
    pub const SINF: Self = Self(*b"sinf");
    pub const SCHI: Self = Self(*b"schi");
    pub const MFHD: Self = Self(*b"mfhd");
    pub const TRAF: Self = Self(*b"traf");
    pub const TFHD: Self = Self(*b"tfhd");
    pub const TFDT: Self = Self(*b"tfdt");
    pub const TRUN: Self = Self(*b"trun");
    pub const MFRA: Self = Self(*b"mfra");
    pub const SIDX: Self = Self(*b"sidx");
    pub const PSSH: Self = Self(*b"pssh");
    pub const EMSG: Self = Self(*b"emsg");
    pub const UDTA: Self = Self(*b"udta");

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Whether boxes of this type hold child boxes.
    pub fn is_container(&self) -> bool {
        matches!(
            *self,
            Self::MOOV
                | Self::TRAK
                | Self::EDTS
                | Self::MDIA
                | Self::MINF
                | Self::DINF
                | Self::STBL
                | Self::STSD
                | Self::MVEX
                | Self::MOOF
                | Self::TRAF
                | Self::MFRA
                | Self::UDTA
                | Self::SINF
                | Self::SCHI
                | Self::AVC1
                | Self::AVC3
                | Self::HEV1
                | Self::HVC1
                | Self::ENCV
                | Self::MP4A
                | Self::ENCA
        )
    }

    /// Whether this is a visual sample entry.
    pub fn is_visual_sample_entry(&self) -> bool {
        matches!(
            *self,
            Self::AVC1 | Self::AVC3 | Self::HEV1 | Self::HVC1 | Self::ENCV
        )
    }

    /// Whether this is an audio sample entry.
    pub fn is_audio_sample_entry(&self) -> bool {
        matches!(*self, Self::MP4A | Self::ENCA)
    }

    /// Offset into the payload where the first child box starts.
    pub fn child_offset(&self, payload: &[u8]) -> usize {
        if self.is_visual_sample_entry() {
            return 78;
        }
        if self.is_audio_sample_entry() {
            // QuickTime sound description versions 1 and 2 append fields.
            let version = payload
                .get(8..10)
                .map(|v| u16::from_be_bytes([v[0], v[1]]))
                .unwrap_or(0);
            return match version {
                1 => 28 + 16,
                2 => 28 + 36,
                _ => 28,
            };
        }
        match *self {
            Self::STSD => 8,
            _ => 0,
        }
    }
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed box and, for containers, its children.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Mp4Box {
    pub box_type: BoxType,
    /// Box size including header.
    pub size: u64,
    /// Absolute offset of the box header in the source.
    pub offset: u64,
    /// Size of the header (8 or 16 bytes).
    pub header_size: u8,
    pub is_container: bool,
    pub fields: BoxFields,
    pub children: Vec<Mp4Box>,
}

impl Mp4Box {
    /// Get the payload size (size - header).
    pub fn data_size(&self) -> u64 {
        self.size.saturating_sub(self.header_size as u64)
    }

    /// Absolute offset one past the last byte of the box.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// First direct child of the given type.
    pub fn child(&self, box_type: BoxType) -> Option<&Mp4Box> {
        self.children.iter().find(|c| c.box_type == box_type)
    }

    /// Depth-first search for the first descendant of the given type.
    pub fn find(&self, box_type: BoxType) -> Option<&Mp4Box> {
        self.children
            .iter()
            .find_map(|c| if c.box_type == box_type { Some(c) } else { c.find(box_type) })
    }

    /// Total number of boxes in this subtree, itself included.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Mp4Box::count).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_allowlist() {
        assert!(BoxType::MOOV.is_container());
        assert!(BoxType::STSD.is_container());
        assert!(BoxType::AVC1.is_container());
        assert!(!BoxType::STTS.is_container());
        assert!(!BoxType(*b"zzzz").is_container());
    }

    #[test]
    fn test_child_offsets() {
        assert_eq!(BoxType::STSD.child_offset(&[]), 8);
        assert_eq!(BoxType::AVC1.child_offset(&[]), 78);
        assert_eq!(BoxType::MP4A.child_offset(&[0; 28]), 28);

        let mut v1 = [0u8; 44];
        v1[9] = 1;
        assert_eq!(BoxType::MP4A.child_offset(&v1), 44);
        assert_eq!(BoxType::TRAK.child_offset(&[]), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(BoxType::MOOV.to_string(), "moov");
        assert_eq!(BoxType([0xFF, 0, 0, 0]).as_str(), "????");
    }
}
