//! The multi-variant application archive model: one named app may carry
//! several binary variants (different fixed addresses, or none), and the
//! correct one is selected for a given target address at flash time.

use crate::app_header::{self, AppHeader, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::flash::pad_to_page;

/// One binary variant of an application: a header plus its payload, and the
/// archive-side metadata that never makes it onto the 76-byte wire header
/// (see the design notes on why `sticky`/fixed-address data lives here
/// instead of in the header bytes themselves).
#[derive(Clone, Debug)]
pub struct AppVariant {
    pub header: AppHeader,
    pub payload: Vec<u8>,
    pub sticky: bool,
    /// Flash addresses this variant was linked to expect, if any. Empty
    /// means the variant is position-independent and works at any address.
    pub fixed_addresses: Vec<u32>,
}

impl AppVariant {
    /// Total on-flash footprint of this variant: header plus payload.
    pub fn size(&self) -> u32 {
        HEADER_SIZE as u32 + self.payload.len() as u32
    }

    /// The full wire image (header bytes followed by payload), padded to a
    /// page boundary and ready to hand to `write_page`.
    pub fn image(&self) -> Vec<u8> {
        let mut bytes = self.header.encode().to_vec();
        bytes.extend_from_slice(&self.payload);
        pad_to_page(&bytes)
    }
}

/// A named application, possibly available in several variants.
#[derive(Clone, Debug, Default)]
pub struct AppBundle {
    variants: Vec<AppVariant>,
}

impl AppBundle {
    pub fn new(variants: Vec<AppVariant>) -> Self {
        AppBundle { variants }
    }

    pub fn variants(&self) -> &[AppVariant] {
        &self.variants
    }

    /// The package name shared by every variant. Variants in a bundle are
    /// required to agree on this; constructing a bundle whose variants
    /// disagree is [`Error::NameMismatch`], a hard error.
    pub fn name(&self) -> Result<String> {
        self.check_names_agree()?;
        let first = self.variants.first().ok_or(Error::AppNotFound {
            name: String::new(),
        })?;
        first.header.get_app_name(&first.payload_with_header())
    }

    fn check_names_agree(&self) -> Result<()> {
        let mut names = self.variants.iter().map(|v| v.header.get_app_name(&v.payload_with_header()));
        let first = match names.next() {
            Some(n) => n?,
            None => return Ok(()),
        };
        for other in names {
            if other? != first {
                return Err(Error::NameMismatch);
            }
        }
        Ok(())
    }

    /// The size every variant agrees its installed footprint should be.
    /// Disagreement is a hard error, just like [`Self::check_names_agree`]
    /// for the package name: every variant in a bundle claims the same slot
    /// size, so `set_size` can grow them all in lockstep.
    pub fn size(&self) -> Result<u32> {
        let mut sizes = self.variants.iter().map(|v| v.header.app_size());
        let first = match sizes.next() {
            Some(s) => s,
            None => return Ok(0),
        };
        for other in sizes {
            if other != first {
                return Err(Error::SizeMismatch {
                    want: first,
                    have: other,
                });
            }
        }
        Ok(first)
    }

    /// Marks every variant `sticky` (protected from a plain `tockloader
    /// erase-apps`-style bulk removal).
    pub fn set_sticky(&mut self, sticky: bool) {
        for variant in &mut self.variants {
            variant.sticky = sticky;
        }
    }

    /// Grows every variant's declared total size to `size`. Shrinking is
    /// rejected: the on-flash footprint can only be grown in place, never
    /// shrunk, since a shrink would abandon bytes the header no longer
    /// claims but that are still occupied in flash.
    pub fn set_size(&mut self, size: u32) -> Result<()> {
        for variant in &mut self.variants {
            let minimum = HEADER_SIZE as u32 + variant.payload.len() as u32;
            if size < minimum {
                return Err(Error::TooSmall {
                    requested: size,
                    minimum,
                });
            }
            variant.header.set_app_size(size);
        }
        Ok(())
    }

    pub fn has_fixed_addresses(&self) -> bool {
        self.variants.iter().any(|v| !v.fixed_addresses.is_empty())
    }

    /// Selects the variant to flash at `address`, matching the Python
    /// original's `TabApp.get_binary` algorithm: prefer a
    /// position-independent variant (no fixed addresses); otherwise find the
    /// one variant whose *first* fixed flash address, minus its own header
    /// length, equals `address` (only `fixed_addresses()[0]` is consulted,
    /// matching `tbfh.get_fixed_addresses()[0]` — a variant is addressed by
    /// its primary fixed address, not any address in its list). The
    /// resulting image is truncated to this bundle's declared `size()` if
    /// the raw variant image is longer, and never extended if shorter.
    pub fn binary(&self, address: u32) -> Result<Vec<u8>> {
        self.check_names_agree()?;

        let chosen = self
            .variants
            .iter()
            .find(|v| v.fixed_addresses.is_empty())
            .or_else(|| {
                self.variants.iter().find(|v| {
                    v.fixed_addresses
                        .first()
                        .map_or(false, |&fixed| fixed.saturating_sub(HEADER_SIZE as u32) == address)
                })
            })
            .ok_or(Error::AppNotFound {
                name: self.name().unwrap_or_default(),
            })?;

        let mut image = chosen.header.encode().to_vec();
        image.extend_from_slice(&chosen.payload);

        let declared_size = self.size()?;
        if (image.len() as u32) > declared_size {
            image.truncate(declared_size as usize);
        }

        Ok(pad_to_page(&image))
    }
}

impl AppVariant {
    fn payload_with_header(&self) -> Vec<u8> {
        let mut bytes = self.header.encode().to_vec();
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(name: &str, total_size: u32, fixed_addresses: Vec<u32>) -> AppVariant {
        let name_bytes = name.as_bytes();
        let payload_len = (total_size as usize) - HEADER_SIZE - name_bytes.len();
        let mut payload = vec![0u8; payload_len];
        payload.extend_from_slice(name_bytes);

        let header = AppHeader {
            total_size,
            entry_offset: 0x20,
            rel_data_offset: HEADER_SIZE as u32,
            rel_data_size: 0,
            text_offset: HEADER_SIZE as u32,
            text_size: payload_len as u32,
            got_offset: 0,
            got_size: 0,
            data_offset: 0,
            data_size: 0,
            bss_mem_offset: 0,
            bss_mem_size: 0,
            min_stack_len: 1024,
            min_app_heap_len: 1024,
            min_kernel_heap_len: 1024,
            package_name_offset: HEADER_SIZE as u32 + payload_len as u32,
            package_name_size: name_bytes.len() as u32,
            checksum: 0,
        };

        AppVariant {
            header,
            payload,
            sticky: false,
            fixed_addresses,
        }
    }

    #[test]
    fn binary_prefers_position_independent_variant() {
        let pic = variant("blink", 512, vec![]);
        let fixed = variant("blink", 512, vec![0x40000 + HEADER_SIZE as u32]);
        let bundle = AppBundle::new(vec![fixed, pic]);
        // Regardless of the requested address, the PIC variant wins.
        let image = bundle.binary(0x99999).unwrap();
        assert!(!image.is_empty());
    }

    #[test]
    fn binary_selects_matching_fixed_variant() {
        let v1 = variant("blink", 512, vec![0x30000 + HEADER_SIZE as u32]);
        let v2 = variant("blink", 512, vec![0x40000 + HEADER_SIZE as u32]);
        let bundle = AppBundle::new(vec![v1, v2]);

        let image = bundle.binary(0x40000).unwrap();
        let header = app_header::decode(&image[..HEADER_SIZE]).unwrap().unwrap();
        assert_eq!(header.total_size, 512);
    }

    #[test]
    fn binary_only_consults_the_first_fixed_address() {
        // A variant whose *second* fixed address would match `address` must
        // still be rejected: only `fixed_addresses()[0]` is consulted.
        let v1 = variant(
            "blink",
            512,
            vec![0x30000 + HEADER_SIZE as u32, 0x40000 + HEADER_SIZE as u32],
        );
        let bundle = AppBundle::new(vec![v1]);
        assert!(bundle.binary(0x40000).is_err());
        assert!(bundle.binary(0x30000).is_ok());
    }

    #[test]
    fn binary_errors_when_no_variant_matches() {
        let v1 = variant("blink", 512, vec![0x30000 + HEADER_SIZE as u32]);
        let bundle = AppBundle::new(vec![v1]);
        assert!(bundle.binary(0x99999).is_err());
    }

    #[test]
    fn set_size_rejects_shrinking() {
        let v1 = variant("blink", 512, vec![]);
        let mut bundle = AppBundle::new(vec![v1]);
        let err = bundle.set_size(10).unwrap_err();
        assert!(matches!(err, Error::TooSmall { .. }));
    }

    #[test]
    fn set_size_grows_every_variant() {
        let v1 = variant("blink", 512, vec![]);
        let v2 = variant("blink", 512, vec![0x40000 + HEADER_SIZE as u32]);
        let mut bundle = AppBundle::new(vec![v1, v2]);
        bundle.set_size(1024).unwrap();
        assert!(bundle.variants().iter().all(|v| v.header.app_size() == 1024));
    }

    #[test]
    fn name_disagreement_is_a_hard_error() {
        let v1 = variant("blink", 512, vec![]);
        let v2 = variant("not-blink", 512, vec![0x40000 + HEADER_SIZE as u32]);
        let bundle = AppBundle::new(vec![v1, v2]);
        assert!(matches!(bundle.name().unwrap_err(), Error::NameMismatch));
    }

    #[test]
    fn size_agrees_across_variants() {
        let v1 = variant("blink", 512, vec![]);
        let v2 = variant("blink", 512, vec![0x40000 + HEADER_SIZE as u32]);
        let bundle = AppBundle::new(vec![v1, v2]);
        assert_eq!(bundle.size().unwrap(), 512);
    }

    #[test]
    fn size_disagreement_is_a_hard_error() {
        let v1 = variant("blink", 512, vec![]);
        let v2 = variant("blink", 1024, vec![0x40000 + HEADER_SIZE as u32]);
        let bundle = AppBundle::new(vec![v1, v2]);
        let err = bundle.size().unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { want: 512, have: 1024 }));
    }

    #[test]
    fn set_sticky_applies_to_every_variant() {
        let v1 = variant("blink", 512, vec![]);
        let mut bundle = AppBundle::new(vec![v1]);
        bundle.set_sticky(true);
        assert!(bundle.variants().iter().all(|v| v.sticky));
    }

    #[test]
    fn has_fixed_addresses_reflects_any_variant() {
        let v1 = variant("blink", 512, vec![]);
        let v2 = variant("blink", 512, vec![0x40000]);
        let bundle = AppBundle::new(vec![v1, v2]);
        assert!(bundle.has_fixed_addresses());

        let only_pic = AppBundle::new(vec![variant("blink", 512, vec![])]);
        assert!(!only_pic.has_fixed_addresses());
    }
}
