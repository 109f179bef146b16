use color_eyre::eyre::{ensure, Result, WrapErr};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

/// Hard ceiling of the first-stage loaders' download windows.
pub const MAX_IMAGE_SIZE: usize = 0xffff;

/// The C140 ramloader probes this absolute offset for the ASCII magic.
const MAGIC_OFFSET: usize = 0x3be2;
const MAGIC: [u8; 4] = *b"1003";

/// The C123 ramloader refuses images that do not start with these four bytes.
const HDR_C123: [u8; 4] = [0xee, 0x4c, 0x9f, 0x63];
/// The C155 starts its ramloader in THUMB mode; this prefix is a `bx pc; nop`
/// pair that switches the core back to ARM before the payload runs.
const HDR_C155: [u8; 4] = [0x78, 0x47, 0xc0, 0x46];

/// Loader dialect and image shape, as selected with `-m`.
#[derive(clap::ValueEnum, Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Mode {
    #[default]
    C123,
    C123xor,
    C140,
    C140xor,
    C155,
    Romload,
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::C123 => write!(f, "c123"),
            Mode::C123xor => write!(f, "c123xor"),
            Mode::C140 => write!(f, "c140"),
            Mode::C140xor => write!(f, "c140xor"),
            Mode::C155 => write!(f, "c155"),
            Mode::Romload => write!(f, "romload"),
        }
    }
}

impl Mode {
    fn header(self) -> &'static [u8] {
        match self {
            Mode::C123 | Mode::C123xor | Mode::C140 | Mode::C140xor => &HDR_C123,
            Mode::C155 => &HDR_C155,
            Mode::Romload => &[],
        }
    }

    fn wants_magic(self) -> bool {
        matches!(self, Mode::C140 | Mode::C140xor)
    }

    /// Whether the ramloader expects a single `0x02` on the wire before the
    /// image proper (it seeds the XOR sum on the phone side).
    pub fn sends_xor_seed(self) -> bool {
        matches!(self, Mode::C155 | Mode::C123xor)
    }

    pub fn is_romload(self) -> bool {
        matches!(self, Mode::Romload)
    }
}

/// A wire-ready image: big-endian length, mode header, payload, trailing
/// seeded XOR byte. Built fresh for every upload attempt.
pub struct UploadImage {
    data: Vec<u8>,
}

impl UploadImage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// The bytes a romload block draws from: everything between the length
    /// prefix and the trailing XOR byte.
    pub fn body(&self) -> &[u8] {
        &self.data[2..self.data.len() - 1]
    }
}

/// Read `path` and wrap it for `mode`. Returns a new owned buffer each time;
/// the caller drops any previous image.
pub fn build(path: &Path, mode: Mode) -> Result<UploadImage> {
    let file =
        fs::read(path).wrap_err_with(|| format!("failed to read image {}", path.display()))?;
    let image = build_from(&file, mode)?;
    log::debug!(
        "read {}: file_size={} hdr_len={} image_len={}",
        path.display(),
        file.len(),
        mode.header().len(),
        image.len()
    );
    Ok(image)
}

fn build_from(file: &[u8], mode: Mode) -> Result<UploadImage> {
    ensure!(
        file.len() <= MAX_IMAGE_SIZE,
        "image is {} bytes, the loaders accept at most {} (64 kiB)",
        file.len(),
        MAX_IMAGE_SIZE
    );

    let hdr = mode.header();
    let mut payload_len = file.len();
    if mode.wants_magic() {
        if file.len() < MAGIC_OFFSET + MAGIC.len() {
            payload_len = MAGIC_OFFSET + MAGIC.len();
        } else {
            log::warn!(
                "file is larger than 15kb, the code on the magic address will \
                 be overwritten; use a chain loader to upload the application instead"
            );
        }
    }

    let total_len = (hdr.len() + payload_len) as u16;
    let mut data = Vec::with_capacity(2 + hdr.len() + payload_len + 1);
    data.extend_from_slice(&total_len.to_be_bytes());
    data.extend_from_slice(hdr);
    data.extend_from_slice(file);
    // zero-fill between the file end and the declared payload size
    data.resize(2 + hdr.len() + payload_len, 0x00);

    // the loader probes for the magic on every upload, so it goes in even
    // when it clobbers the file's own bytes
    if mode.wants_magic() {
        data[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()].copy_from_slice(&MAGIC);
    }

    let mut running_xor = 0x02u8;
    for &b in &data[2..] {
        running_xor ^= b;
    }
    data.push(running_xor);

    Ok(UploadImage { data })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_trailer_holds(image: &UploadImage) -> bool {
        let data = image.as_bytes();
        let mut x = 0x02u8;
        for &b in &data[2..data.len() - 1] {
            x ^= b;
        }
        x == data[data.len() - 1]
    }

    #[test]
    fn test_c123_layout() {
        let file = [0x11u8; 300];
        let image = build_from(&file, Mode::C123).unwrap();
        let data = image.as_bytes();
        assert_eq!(&data[0..2], &(304u16).to_be_bytes());
        assert_eq!(&data[2..6], &HDR_C123);
        assert_eq!(&data[6..306], &file[..]);
        assert_eq!(data.len(), 2 + 4 + 300 + 1);
        assert!(xor_trailer_holds(&image));
    }

    #[test]
    fn test_c155_header() {
        let image = build_from(&[0xab; 64], Mode::C155).unwrap();
        assert_eq!(&image.as_bytes()[2..6], &HDR_C155);
        assert!(xor_trailer_holds(&image));
    }

    #[test]
    fn test_romload_has_no_header() {
        let file = [0x42u8; 1000];
        let image = build_from(&file, Mode::Romload).unwrap();
        let data = image.as_bytes();
        assert_eq!(&data[0..2], &(1000u16).to_be_bytes());
        assert_eq!(&data[2..1002], &file[..]);
        assert_eq!(image.body(), &file[..]);
        assert!(xor_trailer_holds(&image));
    }

    #[test]
    fn test_c140_pads_to_magic() {
        let file = [0x33u8; 128];
        let image = build_from(&file, Mode::C140).unwrap();
        let data = image.as_bytes();
        assert_eq!(&data[MAGIC_OFFSET..MAGIC_OFFSET + 4], b"1003");
        // zero fill between file end and magic
        assert!(data[6 + 128..MAGIC_OFFSET].iter().all(|&b| b == 0));
        assert_eq!(data.len(), 2 + 4 + MAGIC_OFFSET + 4 + 1);
        assert_eq!(
            &data[0..2],
            &((4 + MAGIC_OFFSET + 4) as u16).to_be_bytes()
        );
        assert!(xor_trailer_holds(&image));
    }

    #[test]
    fn test_c140_large_file_magic_still_inserted() {
        let file: Vec<u8> = (0..20 * 1024).map(|i| i as u8).collect();
        let image = build_from(&file, Mode::C140xor).unwrap();
        let data = image.as_bytes();
        // the magic overwrites the file's own bytes at the offset
        assert_eq!(&data[MAGIC_OFFSET..MAGIC_OFFSET + 4], b"1003");
        // no padding: the payload is still the file's full length
        assert_eq!(data.len(), 2 + 4 + file.len() + 1);
        // bytes around the magic are untouched
        assert_eq!(data[MAGIC_OFFSET - 1], file[MAGIC_OFFSET - 7]);
        assert_eq!(data[MAGIC_OFFSET + 4], file[MAGIC_OFFSET - 2]);
        assert!(xor_trailer_holds(&image));
    }

    #[test]
    fn test_oversize_rejected() {
        let file = vec![0u8; MAX_IMAGE_SIZE + 1];
        assert!(build_from(&file, Mode::C123).is_err());
        let file = vec![0u8; MAX_IMAGE_SIZE];
        assert!(build_from(&file, Mode::Romload).is_ok());
    }
}
