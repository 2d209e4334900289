//! Content type detection from leading bytes.
//!
//! Pure functions over byte prefixes; safe to call from any number of
//! threads at once.

use std::{fs::File, io::Read, path::Path};

/// How many leading bytes are inspected
const SNIFF_LEN: usize = 8192;
/// TeX markers are only searched for in this prefix
const TEX_SEARCH_LEN: usize = 4096;
const TAR_BLOCK: usize = 512;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const PDF_MAGIC: &[u8] = b"%PDF-";
const USTAR_MAGIC: &[u8] = b"ustar";
const USTAR_OFFSET: usize = 257;

const TEX_MARKERS: &[&[u8]] = &[
    b"\\documentclass",
    b"\\documentstyle",
    b"\\input",
    b"\\section",
    b"\\setlength",
    b"\\chapter",
    b"\\relax",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::AsRefStr)]
pub enum ContentType {
    #[strum(serialize = "application/gzip")]
    Gzip,
    #[strum(serialize = "application/x-tar")]
    Tar,
    #[strum(serialize = "application/pdf")]
    Pdf,
    #[strum(serialize = "text/x-tex")]
    Tex,
    #[strum(serialize = "text/plain")]
    PlainText,
    #[strum(serialize = "inode/x-empty")]
    Empty,
    #[strum(serialize = "application/octet-stream")]
    Binary,
}

impl ContentType {
    pub fn mime_type(self) -> &'static str {
        self.into()
    }
}

pub fn sniff_file(path: &Path) -> std::io::Result<ContentType> {
    let mut buf = Vec::with_capacity(SNIFF_LEN);
    File::open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut buf)?;
    Ok(sniff_bytes(&buf))
}

pub fn sniff_bytes(data: &[u8]) -> ContentType {
    if data.is_empty() {
        return ContentType::Empty;
    }
    if data.starts_with(GZIP_MAGIC) {
        return ContentType::Gzip;
    }
    if data.starts_with(PDF_MAGIC) {
        return ContentType::Pdf;
    }
    if is_tar_header(data) {
        return ContentType::Tar;
    }
    if !looks_like_text(data) {
        return ContentType::Binary;
    }
    let head = &data[..data.len().min(TEX_SEARCH_LEN)];
    if TEX_MARKERS.iter().any(|m| contains(head, m)) {
        ContentType::Tex
    } else {
        ContentType::PlainText
    }
}

fn is_tar_header(data: &[u8]) -> bool {
    if data.len() < TAR_BLOCK {
        return false;
    }
    let header = &data[..TAR_BLOCK];
    if header[USTAR_OFFSET..].starts_with(USTAR_MAGIC) {
        return true;
    }
    // v7 archives carry no magic, only a checksum
    if header.iter().all(|&b| b == 0) {
        return false;
    }
    let stored = match parse_octal(&header[148..156]) {
        Some(v) => v,
        None => return false,
    };
    let computed: u64 = header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { b' ' } else { b })
        .map(u64::from)
        .sum();
    stored == computed
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits: Vec<u8> = field
        .iter()
        .copied()
        .skip_while(|&b| b == b' ')
        .take_while(|&b| (b'0'..=b'7').contains(&b))
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits
        .iter()
        .try_fold(0u64, |acc, &d| acc.checked_mul(8)?.checked_add(u64::from(d - b'0')))
}

fn looks_like_text(data: &[u8]) -> bool {
    data.iter().all(|&b| match b {
        b'\t' | b'\n' | b'\r' | 0x0c | 0x1b => true,
        0x00..=0x1f | 0x7f => false,
        _ => true,
    })
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
