//! Walks the chain of installed applications starting at a base flash
//! address, stopping at the first end-of-chain or unrecognized header.

use crate::app_header::{self, AppHeader, EndOrUnknown};
use crate::error::{Error, Result};

/// One application found while walking the installed chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledApp {
    /// Address of the app's header (and the app itself).
    pub flash_address: u32,
    pub header: AppHeader,
}

impl InstalledApp {
    /// Address immediately after this app's final byte; the next app (if
    /// any) starts here.
    pub fn end_address(&self) -> u32 {
        self.flash_address + self.header.app_size()
    }
}

/// A source of header bytes the walker can read from an arbitrary address,
/// implemented by whatever already knows how to read flash (a live
/// [`crate::client::BootloaderClient`], or an in-memory buffer in tests).
pub trait FlashReader {
    fn read_at(&mut self, address: u32, length: u32) -> Result<Vec<u8>>;
}

/// Walks the installed-application chain starting at `base_address`,
/// bounded by `region_size` bytes so a corrupted or adversarial chain
/// cannot walk off the end of flash.
pub struct FlashAppWalker<'a, R: FlashReader> {
    reader: &'a mut R,
    region_size: u32,
}

impl<'a, R: FlashReader> FlashAppWalker<'a, R> {
    pub fn new(reader: &'a mut R, region_size: u32) -> Self {
        FlashAppWalker { reader, region_size }
    }

    /// Returns every installed app found walking forward from `base_address`,
    /// stopping at the first end-of-chain sentinel. A non-end, unsupported
    /// header version aborts the walk with [`Error::UnknownHeaderVersion`]
    /// rather than silently truncating the result.
    pub fn walk(&mut self, base_address: u32) -> Result<Vec<InstalledApp>> {
        let mut apps = Vec::new();
        let mut address = base_address;

        while address < base_address.saturating_add(self.region_size) {
            match self.at(address)? {
                Some(app) => {
                    address = app.end_address();
                    apps.push(app);
                }
                None => break,
            }
        }

        Ok(apps)
    }

    /// Reads and decodes a single header at `address`. Returns `Ok(None)` at
    /// end-of-chain, `Err` on an unsupported version or a read failure.
    pub fn at(&mut self, address: u32) -> Result<Option<InstalledApp>> {
        let buffer = self.reader.read_at(address, app_header::HEADER_SIZE as u32)?;
        let version = app_header::peek_version(&buffer)?;
        match version {
            EndOrUnknown::Version1 => {}
            EndOrUnknown::Other(_) if version.is_end_of_chain() => return Ok(None),
            EndOrUnknown::Other(raw) => return Err(Error::UnknownHeaderVersion { version: raw }),
        }

        let header = app_header::decode(&buffer)?.expect("version already checked to be 1");
        Ok(Some(InstalledApp {
            flash_address: address,
            header,
        }))
    }
}
