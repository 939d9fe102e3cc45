//! File kind and character encoding detection.
//!
//! Classification looks at content signatures only (never at file names), so uploads without an
//! extension and URLs with misleading ones are handled the same way.

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};

use crate::error::{Error, Result};

use super::SourceKind;

const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Signatures of common binary formats that are never tabular text.
const BINARY_SIGNATURES: [(&[u8], &str); 6] = [
    (b"%PDF-", "pdf document"),
    (b"\x89PNG", "png image"),
    (b"GIF8", "gif image"),
    (b"\xFF\xD8\xFF", "jpeg image"),
    (b"\x1F\x8B", "gzip archive"),
    (b"PK\x05\x06", "empty zip archive"),
];

/// Candidate delimiters, in tie-break order.
pub const DELIMITER_CANDIDATES: [u8; 5] = [b',', b';', b'\t', b'|', b':'];

/// Outcome of [`detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub kind: SourceKind,
    /// Character encoding for text sources; `None` for spreadsheets.
    pub encoding: Option<&'static Encoding>,
    /// Most frequent candidate delimiter on the first line; a tie-breaker only.
    pub delimiter_hint: Option<u8>,
}

/// Classify `bytes`, looking at no more than `sample_len` bytes for the encoding guess.
pub fn detect(bytes: &[u8], sample_len: usize) -> Result<Detection> {
    if bytes.starts_with(&OLE_MAGIC) {
        return Ok(spreadsheet(SourceKind::LegacySpreadsheet));
    }
    if bytes.starts_with(&ZIP_MAGIC) {
        return if contains(bytes, b"xl/") {
            Ok(spreadsheet(SourceKind::OoxmlSpreadsheet))
        } else {
            Err(Error::UnsupportedFileType {
                detail: "zip archive without a workbook".to_string(),
            })
        };
    }
    if let Some((_, name)) = BINARY_SIGNATURES.iter().find(|(sig, _)| bytes.starts_with(sig)) {
        return Err(Error::UnsupportedFileType {
            detail: (*name).to_string(),
        });
    }

    let sample = &bytes[..bytes.len().min(sample_len.max(1))];
    let encoding = detect_encoding(sample, sample.len() == bytes.len());
    if encoding == UTF_8 && looks_binary(sample) {
        return Err(Error::UnsupportedFileType {
            detail: "binary content".to_string(),
        });
    }

    Ok(Detection {
        kind: SourceKind::Csv,
        encoding: Some(encoding),
        delimiter_hint: delimiter_hint(sample),
    })
}

fn spreadsheet(kind: SourceKind) -> Detection {
    Detection {
        kind,
        encoding: None,
        delimiter_hint: None,
    }
}

/// Pick a text encoding: BOM, then UTF-8 validity, then a statistical guess.
pub fn detect_encoding(sample: &[u8], complete: bool) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(sample) {
        return encoding;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => return UTF_8,
        // A multi-byte sequence cut by the end of the sample is still UTF-8.
        Err(e) if e.error_len().is_none() && !complete => return UTF_8,
        Err(_) => {}
    }
    let mut detector = EncodingDetector::new();
    detector.feed(sample, complete);
    detector.guess(None, true)
}

fn looks_binary(sample: &[u8]) -> bool {
    if sample.contains(&0) {
        return true;
    }
    let control = sample
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0C))
        .count();
    control * 100 > sample.len()
}

fn delimiter_hint(sample: &[u8]) -> Option<u8> {
    let first_line = sample.split(|&b| b == b'\n').next().unwrap_or(sample);
    DELIMITER_CANDIDATES
        .iter()
        .map(|&d| (d, first_line.iter().filter(|&&b| b == d).count()))
        .filter(|&(_, count)| count > 0)
        .fold(None, |best: Option<(u8, usize)>, (d, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((d, count)),
        })
        .map(|(d, _)| d)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_16LE, WINDOWS_1252};

    #[test]
    fn plain_utf8_csv() {
        let d = detect("col a;col b\ndata à1;data b1\n".as_bytes(), 4096).unwrap();
        assert_eq!(d.kind, SourceKind::Csv);
        assert_eq!(d.encoding, Some(UTF_8));
        assert_eq!(d.delimiter_hint, Some(b';'));
    }

    #[test]
    fn latin1_is_not_utf8() {
        let (bytes, _, _) = WINDOWS_1252.encode("nom;ville\nFrançois;Orléans\nHélène;Besançon\n");
        let d = detect(&bytes, 4096).unwrap();
        assert_eq!(d.kind, SourceKind::Csv);
        assert_ne!(d.encoding, Some(UTF_8));
        let (text, _, _) = d.encoding.unwrap().decode(&bytes);
        assert!(text.contains("Orléans"));
    }

    #[test]
    fn bom_wins() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "a,b\n1,2\n".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let d = detect(&bytes, 4096).unwrap();
        assert_eq!(d.encoding, Some(UTF_16LE));
    }

    #[test]
    fn spreadsheets_by_signature() {
        let mut xls = OLE_MAGIC.to_vec();
        xls.extend_from_slice(&[0; 32]);
        assert_eq!(detect(&xls, 4096).unwrap().kind, SourceKind::LegacySpreadsheet);

        let mut xlsx = ZIP_MAGIC.to_vec();
        xlsx.extend_from_slice(b"....[Content_Types].xml....xl/workbook.xml");
        assert_eq!(detect(&xlsx, 4096).unwrap().kind, SourceKind::OoxmlSpreadsheet);
    }

    #[test]
    fn other_binaries_are_rejected() {
        let err = detect(b"%PDF-1.7\n...", 4096).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFileType { .. }));

        let mut zip = ZIP_MAGIC.to_vec();
        zip.extend_from_slice(b"word/document.xml");
        assert!(matches!(
            detect(&zip, 4096).unwrap_err(),
            Error::UnsupportedFileType { .. }
        ));

        assert!(matches!(
            detect(&[0x01, 0x02, 0x00, 0x03, 0x04], 4096).unwrap_err(),
            Error::UnsupportedFileType { .. }
        ));
    }

    #[test]
    fn truncated_multibyte_sample_is_still_utf8() {
        let text = "é".repeat(10);
        let bytes = text.as_bytes();
        assert_eq!(detect_encoding(&bytes[..5], false), UTF_8);
    }
}
