//! Binary-content sniffing: the first bytes of a response body are checked
//! against a fixed set of magic-byte signatures so binary payloads are
//! rejected before they're treated as text.
//!
//! Grounded on the signature-prefix style of this repo's original
//! `bytes_look_like_pdf`/`bytes_look_like_html`/`bytes_look_like_image`
//! helpers, generalised to the full signature set C3 needs.

/// Returns the format name if `bytes` starts with a known binary signature.
pub fn sniff_binary(bytes: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "pdf"),
        (b"\x89PNG\r\n\x1a\n", "png"),
        (b"\xff\xd8\xff", "jpeg"),
        (b"GIF87a", "gif"),
        (b"GIF89a", "gif"),
        (b"PK\x03\x04", "zip"),
        (b"PK\x05\x06", "zip"),
        (b"\x7fELF", "elf"),
        (b"\xfe\xed\xfa\xce", "macho"),
        (b"\xfe\xed\xfa\xcf", "macho"),
        (b"\xce\xfa\xed\xfe", "macho"),
        (b"\xcf\xfa\xed\xfe", "macho"),
        (b"\xca\xfe\xba\xbe", "macho-fat"),
        (b"MZ", "pe"),
        (b"RIFF", "riff"), // WAV/AVI/WEBP share this 4-byte prefix; refined below
        (b"OggS", "ogg"),
        (b"fLaC", "flac"),
        (b"ID3", "mp3"),
        (b"\x1a\x45\xdf\xa3", "webm-mkv"),
        (b"\x00\x00\x00\x18ftyp", "mp4"),
        (b"\x00\x00\x00\x20ftyp", "mp4"),
        (b"BM", "bmp"),
        (b"\x1f\x8b", "gzip"),
        (b"BZh", "bzip2"),
        (b"7z\xbc\xaf\x27\x1c", "7z"),
        (b"Rar!\x1a\x07", "rar"),
        (b"\x25\x21PS", "postscript"),
        (b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1", "ole-cfb"), // legacy doc/xls/ppt
        (b"\x00\x01\x00\x00\x00", "ttf"),
        (b"OTTO", "otf"),
        (b"wOFF", "woff"),
        (b"wOF2", "woff2"),
        (b"SQLite format 3\x00", "sqlite"),
    ];

    for (sig, name) in SIGNATURES {
        if bytes.starts_with(sig) {
            if *name == "riff" {
                if bytes.len() >= 12 && &bytes[8..12] == b"WEBP" {
                    return Some("webp");
                }
                if bytes.len() >= 12 && &bytes[8..12] == b"WAVE" {
                    return Some("wav");
                }
                if bytes.len() >= 12 && &bytes[8..12] == b"AVI " {
                    return Some("avi");
                }
                return Some("riff");
            }
            return Some(name);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_pdf() {
        assert_eq!(sniff_binary(b"%PDF-1.4 rest"), Some("pdf"));
    }

    #[test]
    fn detects_png() {
        assert_eq!(sniff_binary(b"\x89PNG\r\n\x1a\n\x00\x00"), Some("png"));
    }

    #[test]
    fn detects_zip() {
        assert_eq!(sniff_binary(b"PK\x03\x04\x14\x00"), Some("zip"));
    }

    #[test]
    fn detects_webp_via_riff() {
        let mut bytes = b"RIFF\x00\x00\x00\x00WEBP".to_vec();
        bytes.extend_from_slice(b"VP8 ");
        assert_eq!(sniff_binary(&bytes), Some("webp"));
    }

    #[test]
    fn html_is_not_flagged_binary() {
        assert_eq!(sniff_binary(b"<!DOCTYPE html><html></html>"), None);
    }

    #[test]
    fn plain_text_is_not_flagged_binary() {
        assert_eq!(sniff_binary(b"hello world"), None);
    }
}
