//! Minimal JPEG EXIF handling: just enough TIFF to carry an IFD0
//! `ImageDescription` entry in an APP1 segment.

const SOI: [u8; 2] = [0xFF, 0xD8];
const MARKER_APP0: u8 = 0xE0;
const MARKER_APP1: u8 = 0xE1;
const MARKER_SOS: u8 = 0xDA;
const MARKER_EOI: u8 = 0xD9;

/// Identifier at the start of an EXIF APP1 payload.
const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";

/// IFD0 tag for the free-text image description.
pub const TAG_IMAGE_DESCRIPTION: u16 = 0x010E;

const TYPE_BYTE: u16 = 1;
const TYPE_ASCII: u16 = 2;
const TYPE_UNDEFINED: u16 = 7;
const TYPE_UTF8: u16 = 129;

/// Header + IFD0 with a single entry + next-IFD pointer.
const TIFF_FIXED_LEN: usize = 8 + 2 + 12 + 4;

/// Largest payload a single APP1 segment can carry.
const MAX_SEGMENT_PAYLOAD: usize = u16::MAX as usize - 2;

/// Errors raised while reading or writing EXIF segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExifError {
    /// The bytes are not a JPEG stream.
    NotJpeg,
    /// A segment header points past the end of the data.
    Truncated,
    /// The description does not fit into one APP1 segment.
    TooLarge(usize),
}

impl std::fmt::Display for ExifError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotJpeg => write!(f, "Data is not a JPEG image"),
            Self::Truncated => write!(f, "JPEG segment is truncated"),
            Self::TooLarge(len) => write!(
                f,
                "Description of {len} bytes does not fit into an EXIF segment"
            ),
        }
    }
}

impl std::error::Error for ExifError {}

#[derive(Debug, Clone, Copy)]
struct Segment {
    marker: u8,
    start: usize,
    end: usize,
}

impl Segment {
    fn payload<'a>(&self, jpeg: &'a [u8]) -> &'a [u8] {
        &jpeg[self.start + 4..self.end]
    }

    fn is_exif(&self, jpeg: &[u8]) -> bool {
        self.marker == MARKER_APP1 && self.payload(jpeg).starts_with(EXIF_HEADER)
    }
}

/// Walks the marker segments in front of the scan data.
///
/// Returns the segments plus the offset where the entropy-coded tail (SOS or
/// EOI) begins.
fn header_segments(jpeg: &[u8]) -> Result<(Vec<Segment>, usize), ExifError> {
    if !jpeg.starts_with(&SOI) {
        return Err(ExifError::NotJpeg);
    }

    let mut segments = Vec::new();
    let mut pos = SOI.len();
    loop {
        if pos + 1 >= jpeg.len() {
            return Ok((segments, jpeg.len()));
        }
        if jpeg[pos] != 0xFF {
            return Err(ExifError::Truncated);
        }
        let marker = jpeg[pos + 1];
        if marker == 0xFF {
            // fill byte
            pos += 1;
            continue;
        }
        if marker == MARKER_SOS || marker == MARKER_EOI {
            return Ok((segments, pos));
        }
        if marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            pos += 2;
            continue;
        }
        if pos + 4 > jpeg.len() {
            return Err(ExifError::Truncated);
        }
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        if len < 2 || pos + 2 + len > jpeg.len() {
            return Err(ExifError::Truncated);
        }
        segments.push(Segment {
            marker,
            start: pos,
            end: pos + 2 + len,
        });
        pos += 2 + len;
    }
}

/// Returns the TIFF body of the first EXIF APP1 segment, if any.
///
/// Non-JPEG input yields `Ok(None)`.
pub fn find_exif(jpeg: &[u8]) -> Result<Option<&[u8]>, ExifError> {
    let (segments, _) = match header_segments(jpeg) {
        Ok(found) => found,
        Err(ExifError::NotJpeg) => return Ok(None),
        Err(err) => return Err(err),
    };
    Ok(segments
        .iter()
        .find(|segment| segment.is_exif(jpeg))
        .map(|segment| &segment.payload(jpeg)[EXIF_HEADER.len()..]))
}

/// Replaces any EXIF segment in `jpeg` with one carrying `description`.
pub fn with_image_description(jpeg: &[u8], description: &str) -> Result<Vec<u8>, ExifError> {
    let (segments, tail) = header_segments(jpeg)?;
    let app1 = build_app1(description.as_bytes())?;

    let mut output = Vec::with_capacity(jpeg.len() + app1.len());
    output.extend_from_slice(&SOI);
    let mut inserted = false;
    for segment in &segments {
        if !inserted && segment.marker != MARKER_APP0 {
            output.extend_from_slice(&app1);
            inserted = true;
        }
        if segment.is_exif(jpeg) {
            continue;
        }
        output.extend_from_slice(&jpeg[segment.start..segment.end]);
    }
    if !inserted {
        output.extend_from_slice(&app1);
    }
    output.extend_from_slice(&jpeg[tail..]);
    Ok(output)
}

/// Builds a complete APP1 segment, marker included.
fn build_app1(description: &[u8]) -> Result<Vec<u8>, ExifError> {
    // ASCII values carry a trailing NUL.
    let value_len = description.len() + 1;
    let payload_len = EXIF_HEADER.len() + TIFF_FIXED_LEN + value_len;
    if payload_len > MAX_SEGMENT_PAYLOAD {
        return Err(ExifError::TooLarge(description.len()));
    }
    let count = u32::try_from(value_len).map_err(|_| ExifError::TooLarge(description.len()))?;
    let segment_len =
        u16::try_from(payload_len + 2).map_err(|_| ExifError::TooLarge(description.len()))?;

    let mut out = Vec::with_capacity(payload_len + 4);
    out.extend_from_slice(&[0xFF, MARKER_APP1]);
    out.extend_from_slice(&segment_len.to_be_bytes());
    out.extend_from_slice(EXIF_HEADER);

    // TIFF header, little endian, IFD0 right after it.
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());

    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&TAG_IMAGE_DESCRIPTION.to_le_bytes());
    out.extend_from_slice(&TYPE_ASCII.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    if value_len <= 4 {
        let mut inline = [0u8; 4];
        inline[..description.len()].copy_from_slice(description);
        out.extend_from_slice(&inline);
        out.extend_from_slice(&0u32.to_le_bytes());
    } else {
        out.extend_from_slice(&(TIFF_FIXED_LEN as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(description);
        out.push(0);
    }
    Ok(out)
}

#[derive(Clone, Copy)]
enum ByteOrder {
    Little,
    Big,
}

struct TiffReader<'a> {
    data: &'a [u8],
    order: ByteOrder,
}

impl<'a> TiffReader<'a> {
    fn new(data: &'a [u8]) -> Option<Self> {
        let order = match data.get(..2)? {
            b"II" => ByteOrder::Little,
            b"MM" => ByteOrder::Big,
            _ => return None,
        };
        let reader = Self { data, order };
        if reader.u16_at(2)? != 42 {
            return None;
        }
        Some(reader)
    }

    fn u16_at(&self, offset: usize) -> Option<u16> {
        let bytes: [u8; 2] = self.data.get(offset..offset + 2)?.try_into().ok()?;
        Some(match self.order {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        })
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(offset..offset + 4)?.try_into().ok()?;
        Some(match self.order {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        })
    }

    /// Raw bytes of a single-byte-per-element IFD0 entry.
    fn ifd0_bytes(&self, tag: u16) -> Option<&'a [u8]> {
        let ifd = self.u32_at(4)? as usize;
        let entries = self.u16_at(ifd)? as usize;
        for index in 0..entries {
            let entry = ifd + 2 + index * 12;
            if self.u16_at(entry)? != tag {
                continue;
            }
            let kind = self.u16_at(entry + 2)?;
            if !matches!(kind, TYPE_BYTE | TYPE_ASCII | TYPE_UNDEFINED | TYPE_UTF8) {
                return None;
            }
            let count = self.u32_at(entry + 4)? as usize;
            let start = if count <= 4 {
                entry + 8
            } else {
                self.u32_at(entry + 8)? as usize
            };
            return self.data.get(start..start.checked_add(count)?);
        }
        None
    }
}

/// Reads the IFD0 `ImageDescription` from a TIFF body, trailing NULs removed.
pub fn image_description(tiff: &[u8]) -> Option<String> {
    let raw = TiffReader::new(tiff)?.ifd0_bytes(TAG_IMAGE_DESCRIPTION)?;
    let end = raw
        .iter()
        .rposition(|byte| *byte != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    Some(String::from_utf8_lossy(&raw[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SOI, a JFIF APP0, a fake SOS and EOI.
    fn bare_jpeg() -> Vec<u8> {
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0x00]);
        jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02, 0x12, 0x34, 0xFF, 0xD9]);
        jpeg
    }

    #[test]
    fn description_survives_a_write_and_read() {
        let jpeg = with_image_description(&bare_jpeg(), r#"{"prompt":"a red fox"}"#)
            .expect("write exif");
        let tiff = find_exif(&jpeg).expect("walk").expect("exif present");
        assert_eq!(
            image_description(tiff).as_deref(),
            Some(r#"{"prompt":"a red fox"}"#)
        );
    }

    #[test]
    fn app1_goes_after_jfif_and_scan_data_is_untouched() {
        let original = bare_jpeg();
        let jpeg = with_image_description(&original, "hello").expect("write exif");
        assert_eq!(&jpeg[..2], &SOI);
        assert_eq!(&jpeg[2..4], &[0xFF, MARKER_APP0]);
        assert_eq!(&jpeg[11..13], &[0xFF, MARKER_APP1]);
        assert!(jpeg.ends_with(&original[11..]));
    }

    #[test]
    fn existing_exif_is_replaced() {
        let first = with_image_description(&bare_jpeg(), "first").expect("first write");
        let second = with_image_description(&first, "second").expect("second write");
        let exif_segments = header_segments(&second)
            .expect("walk")
            .0
            .iter()
            .filter(|segment| segment.is_exif(&second))
            .count();
        assert_eq!(exif_segments, 1);
        let tiff = find_exif(&second).expect("walk").expect("exif");
        assert_eq!(image_description(tiff).as_deref(), Some("second"));
    }

    #[test]
    fn short_descriptions_are_stored_inline() {
        let jpeg = with_image_description(&bare_jpeg(), "abc").expect("write exif");
        let tiff = find_exif(&jpeg).expect("walk").expect("exif");
        assert_eq!(image_description(tiff).as_deref(), Some("abc"));
    }

    #[test]
    fn big_endian_tiff_is_readable() {
        let text = b"big endian text";
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"MM");
        tiff.extend_from_slice(&42u16.to_be_bytes());
        tiff.extend_from_slice(&8u32.to_be_bytes());
        tiff.extend_from_slice(&2u16.to_be_bytes());
        // an unrelated Orientation entry first
        tiff.extend_from_slice(&0x0112u16.to_be_bytes());
        tiff.extend_from_slice(&3u16.to_be_bytes());
        tiff.extend_from_slice(&1u32.to_be_bytes());
        tiff.extend_from_slice(&[0, 1, 0, 0]);
        tiff.extend_from_slice(&TAG_IMAGE_DESCRIPTION.to_be_bytes());
        tiff.extend_from_slice(&TYPE_ASCII.to_be_bytes());
        tiff.extend_from_slice(&(text.len() as u32 + 1).to_be_bytes());
        tiff.extend_from_slice(&38u32.to_be_bytes());
        tiff.extend_from_slice(&0u32.to_be_bytes());
        tiff.extend_from_slice(text);
        tiff.push(0);

        assert_eq!(
            image_description(&tiff).as_deref(),
            Some("big endian text")
        );
    }

    #[test]
    fn missing_segments_and_garbage() {
        assert_eq!(find_exif(&bare_jpeg()), Ok(None));
        assert_eq!(find_exif(b"\x89PNG\r\n\x1a\n"), Ok(None));
        assert_eq!(
            find_exif(&[0xFF, 0xD8, 0xFF, 0xE1, 0x40, 0x00]),
            Err(ExifError::Truncated)
        );
        assert_eq!(image_description(b"II*\0\xff\xff\xff\xff"), None);
        assert_eq!(image_description(b"XX"), None);
    }

    #[test]
    fn oversized_descriptions_are_rejected() {
        let huge = "x".repeat(70_000);
        assert_eq!(
            with_image_description(&bare_jpeg(), &huge),
            Err(ExifError::TooLarge(70_000))
        );
    }
}
