//! High-level operations built on top of [`crate::client::BootloaderClient`]
//! and [`crate::walker::FlashAppWalker`]: the things a user actually wants to
//! do, as opposed to the individual wire commands that do them.

use std::time::{Duration, Instant};

use crate::app_header::{self, AppHeader, HEADER_SIZE};
use crate::client::{crc32, BootloaderClient, InBootloader};
use crate::error::{Error, Result};
use crate::flash::{pad_to_page, PAGE_SIZE};
use crate::transport::SerialIo;
use crate::walker::{FlashAppWalker, FlashReader, InstalledApp};

/// Adapts a live [`BootloaderClient`] to the [`FlashReader`] trait the
/// walker needs, so the same walker code works against real hardware and
/// against the in-memory fake used in tests.
struct ClientReader<'a, P: SerialIo> {
    client: &'a mut BootloaderClient<InBootloader, P>,
}

impl<'a, P: SerialIo> FlashReader for ClientReader<'a, P> {
    fn read_at(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        let length = u16::try_from(length).map_err(|_| Error::BadArgs)?;
        self.client.read_range(address, length)
    }
}

/// Outcome of a successful [`flash`]/[`append`]/[`replace`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashReport {
    pub bytes_written: usize,
    pub elapsed: Duration,
}

/// One application as reported by [`list`].
#[derive(Debug, Clone)]
pub struct ListedApp {
    pub address: u32,
    pub end_address: u32,
    pub name: String,
    pub header: Option<AppHeader>,
}

/// Writes `image` (header-prefixed app bytes) starting at `address`,
/// page by page, verifies the whole write with one CRC check, then erases
/// the page immediately past the end of the image to leave a clean
/// end-of-chain boundary for whatever gets walked next.
fn write_image<P: SerialIo>(
    client: &mut BootloaderClient<InBootloader, P>,
    image: &[u8],
    address: u32,
) -> Result<FlashReport> {
    let start = Instant::now();
    let padded = pad_to_page(image);

    for (i, page) in padded.chunks(PAGE_SIZE as usize).enumerate() {
        let page_address = address + (i as u32) * PAGE_SIZE;
        client.write_page(page_address, page)?;
        log::debug!("wrote page at {page_address:#010x}");
    }

    client.crc_internal_flash(address, padded.len() as u32, &padded)?;
    client.erase_page(address + padded.len() as u32)?;

    let elapsed = start.elapsed();
    log::info!(
        "wrote {} bytes in {:.3} seconds",
        padded.len(),
        elapsed.as_secs_f64()
    );
    log::info!("CRC check passed");

    Ok(FlashReport {
        bytes_written: padded.len(),
        elapsed,
    })
}

/// Flashes `image` at `address`, overwriting whatever was previously there.
/// This is the base primitive [`append`] and [`replace`] are both built on.
pub fn flash<P: SerialIo>(
    client: &mut BootloaderClient<InBootloader, P>,
    image: &[u8],
    address: u32,
) -> Result<FlashReport> {
    write_image(client, image, address)
}

/// Walks the installed chain starting at `base_address` and returns every
/// app found. When `verbose` is `false`, omits the decoded header from apps
/// other than those needed to compute addresses (matches the original
/// CLI's terse vs. verbose listing modes).
pub fn list<P: SerialIo>(
    client: &mut BootloaderClient<InBootloader, P>,
    base_address: u32,
    region_size: u32,
    verbose: bool,
) -> Result<Vec<ListedApp>> {
    let mut reader = ClientReader { client };
    let mut walker = FlashAppWalker::new(&mut reader, region_size);
    let apps: Vec<InstalledApp> = walker.walk(base_address)?;

    apps.into_iter()
        .map(|app| {
            let name = read_app_name(&mut reader, &app)?;
            Ok(ListedApp {
                address: app.flash_address,
                end_address: app.end_address(),
                name,
                header: if verbose { Some(app.header) } else { None },
            })
        })
        .collect()
}

/// Fetches an installed app's package name directly from flash, reading
/// just the `package_name_size` bytes at `flash_address + package_name_offset`
/// rather than the whole header-to-name prefix.
fn read_app_name<P: SerialIo>(reader: &mut ClientReader<'_, P>, app: &InstalledApp) -> Result<String> {
    if app.header.package_name_size == 0 {
        return Ok(String::new());
    }
    let name_bytes = reader.read_at(
        app.flash_address + app.header.package_name_offset,
        app.header.package_name_size,
    )?;
    if name_bytes.len() != app.header.package_name_size as usize {
        return Err(Error::ShortRead {
            expected: app.header.package_name_size as usize,
            got: name_bytes.len(),
        });
    }
    String::from_utf8(name_bytes).map_err(|_| Error::MalformedHeader)
}

/// Walks the installed chain from `base_address` to find the cursor a new
/// app should be appended at: the end of the last installed app, or
/// `base_address` itself if nothing is installed yet.
///
/// An unrecognized header version aborts the walk with
/// [`Error::UnknownHeaderVersion`] unless `force` is set, in which case the
/// slot the unknown header occupies is treated like end-of-chain and reused.
pub fn append<P: SerialIo>(
    client: &mut BootloaderClient<InBootloader, P>,
    image: &[u8],
    base_address: u32,
    region_size: u32,
    force: bool,
) -> Result<FlashReport> {
    let append_address = {
        let mut reader = ClientReader { client: &mut *client };
        let mut walker = FlashAppWalker::new(&mut reader, region_size);
        let mut cursor = base_address;
        // Bounded exactly like `FlashAppWalker::walk`, so a corrupt chain
        // (e.g. a zero `total_size` that would never advance the cursor)
        // cannot spin this loop forever.
        while cursor < base_address.saturating_add(region_size) {
            match walker.at(cursor) {
                Ok(Some(app)) => cursor = app.end_address(),
                Ok(None) => break,
                Err(Error::UnknownHeaderVersion { version }) if force => {
                    log::warn!(
                        "unrecognized header version {version} at {cursor:#010x}; \
                         overwriting it because --force was given"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        cursor
    };

    flash(client, image, append_address)
}

/// Replaces the app named in `image`'s own header with `image`, in place at
/// its currently installed address. The installed app and the new image
/// must claim the exact same `total_size`; a size-class mismatch is a hard
/// error rather than something this operation resolves automatically.
pub fn replace<P: SerialIo>(
    client: &mut BootloaderClient<InBootloader, P>,
    image: &[u8],
    base_address: u32,
    region_size: u32,
) -> Result<FlashReport> {
    let new_header = app_header::decode(image)?.ok_or(Error::MalformedHeader)?;
    let target_name = new_header.get_app_name(image)?;

    // Walk one header at a time (rather than `list`'s walk-the-whole-chain)
    // so the search stops the moment a name match is found, instead of
    // first demanding the entire remainder of the chain decode cleanly.
    let target = {
        let mut reader = ClientReader { client: &mut *client };
        let mut cursor = base_address;
        let mut found = None;
        while cursor < base_address.saturating_add(region_size) {
            let step = {
                let mut walker = FlashAppWalker::new(&mut reader, region_size);
                walker.at(cursor)?
            };
            match step {
                Some(app) => {
                    let name = read_app_name(&mut reader, &app)?;
                    if name == target_name {
                        found = Some(app);
                        break;
                    }
                    cursor = app.end_address();
                }
                None => break,
            }
        }
        found
    };
    let target = target.ok_or_else(|| Error::AppNotFound {
        name: target_name.clone(),
    })?;

    if target.header.total_size != new_header.total_size {
        return Err(Error::SizeMismatch {
            want: target.header.total_size,
            have: new_header.total_size,
        });
    }

    flash(client, image, target.flash_address)
}

/// Computes the CRC-32 this crate's checks use, exposed for callers that
/// want to verify an image before flashing it.
pub fn expected_crc(bytes: &[u8]) -> u32 {
    crc32(bytes)
}
