//! Decodes and encodes the 76-byte version-1 *AppHeader* record that
//! prefixes every installed application in flash.

use crate::error::{Error, Result};

/// Size in bytes of the fixed version-1 header layout.
pub const HEADER_SIZE: usize = 76;

/// A decoded version-1 *AppHeader*. Field order and widths match the
/// on-flash little-endian layout exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppHeader {
    pub total_size: u32,
    pub entry_offset: u32,
    pub rel_data_offset: u32,
    pub rel_data_size: u32,
    pub text_offset: u32,
    pub text_size: u32,
    pub got_offset: u32,
    pub got_size: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub bss_mem_offset: u32,
    pub bss_mem_size: u32,
    pub min_stack_len: u32,
    pub min_app_heap_len: u32,
    pub min_kernel_heap_len: u32,
    pub package_name_offset: u32,
    pub package_name_size: u32,
    pub checksum: u32,
}

/// The result of attempting to read the `version` word of a header.
///
/// A version other than `1` does not necessarily mean an error: `0` and
/// `0xFFFF_FFFF` both mark the end of the installed-application chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndOrUnknown {
    /// `version == 1`; a live header follows.
    Version1,
    /// Any other version word.
    Other(u32),
}

impl EndOrUnknown {
    /// `true` for the two sentinel values (`0` and `0xFFFFFFFF`) that mark
    /// the end of the installed-application chain.
    pub fn is_end_of_chain(self) -> bool {
        matches!(self, EndOrUnknown::Other(0) | EndOrUnknown::Other(0xFFFF_FFFF))
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Reads the first 4 bytes of `buffer` as the header's version word,
/// without requiring the full 76 bytes to be present. Used by walkers that
/// want to bail out early on an end-of-chain marker.
pub fn peek_version(buffer: &[u8]) -> Result<EndOrUnknown> {
    if buffer.len() < 4 {
        return Err(Error::ShortRead {
            expected: 4,
            got: buffer.len(),
        });
    }
    Ok(match read_u32(buffer, 0) {
        1 => EndOrUnknown::Version1,
        other => EndOrUnknown::Other(other),
    })
}

/// Parses the first [`HEADER_SIZE`] bytes of `buffer` as an *AppHeader*.
///
/// Returns `Ok(None)` if the version word is not `1` (end-of-chain or
/// unknown version — use [`peek_version`] to tell them apart before calling
/// this if that distinction matters to the caller).
pub fn decode(buffer: &[u8]) -> Result<Option<AppHeader>> {
    if buffer.len() < HEADER_SIZE {
        return Err(Error::ShortRead {
            expected: HEADER_SIZE,
            got: buffer.len(),
        });
    }
    if read_u32(buffer, 0) != 1 {
        return Ok(None);
    }

    Ok(Some(AppHeader {
        total_size: read_u32(buffer, 4),
        entry_offset: read_u32(buffer, 8),
        rel_data_offset: read_u32(buffer, 12),
        rel_data_size: read_u32(buffer, 16),
        text_offset: read_u32(buffer, 20),
        text_size: read_u32(buffer, 24),
        got_offset: read_u32(buffer, 28),
        got_size: read_u32(buffer, 32),
        data_offset: read_u32(buffer, 36),
        data_size: read_u32(buffer, 40),
        bss_mem_offset: read_u32(buffer, 44),
        bss_mem_size: read_u32(buffer, 48),
        min_stack_len: read_u32(buffer, 52),
        min_app_heap_len: read_u32(buffer, 56),
        min_kernel_heap_len: read_u32(buffer, 60),
        package_name_offset: read_u32(buffer, 64),
        package_name_size: read_u32(buffer, 68),
        checksum: read_u32(buffer, 72),
    }))
}

impl AppHeader {
    /// Size of the header itself; always [`HEADER_SIZE`] for version 1.
    pub fn header_size(&self) -> u32 {
        HEADER_SIZE as u32
    }

    /// Total bytes this app consumes in flash, header included.
    pub fn app_size(&self) -> u32 {
        self.total_size
    }

    /// Overwrites `total_size`. Callers enforcing the growth-only invariant
    /// do so before calling this (see [`crate::bundle::AppBundle::set_size`]).
    pub fn set_app_size(&mut self, size: u32) {
        self.total_size = size;
    }

    /// Reads the UTF-8 package name out of `app_bytes` (the full
    /// `header ⧺ payload` image, or the equivalent bytes read back from
    /// flash), using this header's `package_name_offset`/`package_name_size`.
    pub fn get_app_name(&self, app_bytes: &[u8]) -> Result<String> {
        if self.package_name_size == 0 {
            return Ok(String::new());
        }
        let start = self.package_name_offset as usize;
        let end = start + self.package_name_size as usize;
        let slice = app_bytes.get(start..end).ok_or(Error::MalformedHeader)?;
        String::from_utf8(slice.to_vec()).map_err(|_| Error::MalformedHeader)
    }

    /// Serializes the header back to its 76-byte wire form, recomputing the
    /// checksum as the XOR of every other 4-byte word (mirroring the
    /// XOR-fold checksum construction used by the Tock Binary Format
    /// tooling this crate's archive format is descended from).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        write_u32(&mut buf, 0, 1);
        write_u32(&mut buf, 4, self.total_size);
        write_u32(&mut buf, 8, self.entry_offset);
        write_u32(&mut buf, 12, self.rel_data_offset);
        write_u32(&mut buf, 16, self.rel_data_size);
        write_u32(&mut buf, 20, self.text_offset);
        write_u32(&mut buf, 24, self.text_size);
        write_u32(&mut buf, 28, self.got_offset);
        write_u32(&mut buf, 32, self.got_size);
        write_u32(&mut buf, 36, self.data_offset);
        write_u32(&mut buf, 40, self.data_size);
        write_u32(&mut buf, 44, self.bss_mem_offset);
        write_u32(&mut buf, 48, self.bss_mem_size);
        write_u32(&mut buf, 52, self.min_stack_len);
        write_u32(&mut buf, 56, self.min_app_heap_len);
        write_u32(&mut buf, 60, self.min_kernel_heap_len);
        write_u32(&mut buf, 64, self.package_name_offset);
        write_u32(&mut buf, 68, self.package_name_size);
        // checksum field (offset 72) left zeroed for the fold below.

        let mut checksum: u32 = 0;
        for word in buf.chunks_exact(4) {
            checksum ^= u32::from_le_bytes(word.try_into().unwrap());
        }
        write_u32(&mut buf, 72, checksum);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> AppHeader {
        AppHeader {
            total_size: 4096,
            entry_offset: 0x20,
            rel_data_offset: 76,
            rel_data_size: 0,
            text_offset: 76,
            text_size: 2000,
            got_offset: 2076,
            got_size: 16,
            data_offset: 2092,
            data_size: 32,
            bss_mem_offset: 0,
            bss_mem_size: 256,
            min_stack_len: 1024,
            min_app_heap_len: 1024,
            min_kernel_heap_len: 1024,
            package_name_offset: 2124,
            package_name_size: 5,
            checksum: 0,
        }
    }

    #[test]
    fn round_trip() {
        let header = sample_header();
        let encoded = header.encode();
        let decoded = decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.total_size, header.total_size);
        assert_eq!(decoded.package_name_offset, header.package_name_offset);
        // The checksum is recomputed deterministically, so re-encoding the
        // decoded header reproduces the exact same bytes.
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn end_of_chain_is_not_an_error() {
        let mut buf = [0u8; HEADER_SIZE];
        write_u32(&mut buf, 0, 0xFFFF_FFFF);
        assert_eq!(decode(&buf).unwrap(), None);
        assert!(peek_version(&buf).unwrap().is_end_of_chain());

        write_u32(&mut buf, 0, 0);
        assert_eq!(decode(&buf).unwrap(), None);
        assert!(peek_version(&buf).unwrap().is_end_of_chain());
    }

    #[test]
    fn unknown_version_is_distinguishable_from_end_of_chain() {
        let mut buf = [0u8; HEADER_SIZE];
        write_u32(&mut buf, 0, 2);
        assert_eq!(decode(&buf).unwrap(), None);
        let v = peek_version(&buf).unwrap();
        assert!(!v.is_end_of_chain());
        assert_eq!(v, EndOrUnknown::Other(2));
    }

    #[test]
    fn get_app_name_reads_name_slice() {
        let mut header = sample_header();
        header.package_name_offset = 0;
        header.package_name_size = 5;
        let app_bytes = b"blink-rest-of-app";
        assert_eq!(header.get_app_name(app_bytes).unwrap(), "blink");
    }

    #[test]
    fn get_app_name_rejects_out_of_bounds() {
        let mut header = sample_header();
        header.package_name_offset = 1000;
        header.package_name_size = 5;
        assert!(header.get_app_name(b"short").is_err());
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let buf = [0u8; 10];
        assert!(decode(&buf).is_err());
    }
}
