//! The bootloader protocol engine: a typestate-guarded client that can only
//! issue bootloader commands while actually in bootloader mode.

use std::marker::PhantomData;

use crc_any::CRCu32;

use crate::error::{Error, Result};
use crate::flash::PAGE_SIZE;
use crate::framer::{self, ESCAPE_CHAR, SYNC_MESSAGE};
use crate::transport::{RealSerialPort, SerialIo, Transport};

const COMMAND_PING: u8 = 0x01;
const COMMAND_RESET: u8 = 0x05;
const COMMAND_ERASE_PAGE: u8 = 0x06;
const COMMAND_WRITE_PAGE: u8 = 0x07;
const COMMAND_READ_RANGE: u8 = 0x11;
const COMMAND_CRC_INTERNAL_FLASH: u8 = 0x15;

const RESPONSE_PONG: u8 = 0x11;
const RESPONSE_BAD_ADDR: u8 = 0x12;
const RESPONSE_INTERNAL_ERROR: u8 = 0x13;
const RESPONSE_BAD_ARGS: u8 = 0x14;
const RESPONSE_OK: u8 = 0x15;
const RESPONSE_READ_RANGE: u8 = 0x20;
const RESPONSE_CRC_INTERNAL_FLASH: u8 = 0x23;

const PING_ATTEMPTS: u32 = 30;

/// Marker type: the client holds an ordinary, not-yet-entered transport.
pub struct Open;

/// Marker type: the client has successfully entered bootloader mode and
/// bootloader-only commands become callable.
pub struct InBootloader;

/// Wraps a [`Transport`] with a typestate parameter so that bootloader
/// commands (erase, write, read, crc) are only reachable after a successful
/// [`BootloaderClient::enter`].
pub struct BootloaderClient<S, P: SerialIo = RealSerialPort> {
    transport: Transport<P>,
    _state: PhantomData<S>,
}

impl<P: SerialIo> BootloaderClient<Open, P> {
    /// Wraps an already-open transport. The target may or may not be in
    /// bootloader mode yet; call [`enter`](Self::enter) to find out.
    pub fn new(transport: Transport<P>) -> Self {
        BootloaderClient {
            transport,
            _state: PhantomData,
        }
    }

    /// Toggles the DTR/RTS entry sequence, then pings up to 30 times waiting
    /// for a "pong". On success the transport is handed back wrapped in the
    /// `InBootloader` state; on failure the original transport is returned
    /// alongside the error so the caller can retry or clean up.
    pub fn enter(mut self) -> std::result::Result<BootloaderClient<InBootloader, P>, (Transport<P>, Error)> {
        if let Err(e) = self.transport.toggle_bootloader_entry() {
            return Err((self.transport, e));
        }

        for attempt in 0..PING_ATTEMPTS {
            match ping(&mut self.transport) {
                Ok(()) => {
                    return Ok(BootloaderClient {
                        transport: self.transport,
                        _state: PhantomData,
                    })
                }
                Err(e) => {
                    log::debug!("ping attempt {attempt} failed: {e}");
                }
            }
        }

        Err((self.transport, Error::NoPong))
    }
}

#[cfg(test)]
impl<P: SerialIo> BootloaderClient<InBootloader, P> {
    /// Wraps an already-entered transport directly, skipping the
    /// handshake. Only meaningful in tests, where the fake transport has no
    /// real bootloader to enter.
    pub(crate) fn for_test(transport: Transport<P>) -> Self {
        BootloaderClient {
            transport,
            _state: PhantomData,
        }
    }
}

impl<P: SerialIo> BootloaderClient<InBootloader, P> {
    /// Drives the exit-bootloader signal sequence and returns the client to
    /// the `Open` state. Infallible: I/O errors during the exit handshake
    /// are logged, not propagated, since the target is about to reset
    /// regardless of whether every pin transition was observed.
    pub fn exit(mut self) -> BootloaderClient<Open, P> {
        if let Err(e) = self.transport.exit_bootloader() {
            log::warn!("error while exiting bootloader mode (continuing anyway): {e}");
        }
        BootloaderClient {
            transport: self.transport,
            _state: PhantomData,
        }
    }

    /// Reads `length` bytes starting at `address`. The wire payload carries
    /// `length` as a `u16`, so a single call can never read more than 64 KiB.
    pub fn read_range(&mut self, address: u32, length: u16) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&length.to_le_bytes());
        issue_command(&mut self.transport, COMMAND_READ_RANGE, &payload)?;
        framer::decode_response(&mut self.transport, RESPONSE_READ_RANGE, length as usize)
    }

    /// Erases a single [`PAGE_SIZE`]-aligned page at `address`.
    pub fn erase_page(&mut self, address: u32) -> Result<()> {
        let payload = address.to_le_bytes();
        issue_command(&mut self.transport, COMMAND_ERASE_PAGE, &payload)?;
        expect_ok(&mut self.transport)
    }

    /// Writes one page's worth of bytes at `address`. `page` must be exactly
    /// [`PAGE_SIZE`] bytes (pad with [`crate::flash::pad_to_page`] first).
    ///
    /// Only the page payload is escaped; the 4-byte address is written
    /// verbatim ahead of the escaped payload and the command terminator.
    pub fn write_page(&mut self, address: u32, page: &[u8]) -> Result<()> {
        if page.len() != PAGE_SIZE as usize {
            return Err(Error::SizeMismatch {
                want: PAGE_SIZE,
                have: page.len() as u32,
            });
        }

        let mut frame = Vec::with_capacity(SYNC_MESSAGE.len() + 4 + page.len() + 2);
        frame.extend_from_slice(&SYNC_MESSAGE);
        frame.extend_from_slice(&address.to_le_bytes());
        for &byte in page {
            frame.push(byte);
            if byte == ESCAPE_CHAR {
                frame.push(ESCAPE_CHAR);
            }
        }
        frame.push(ESCAPE_CHAR);
        frame.push(COMMAND_WRITE_PAGE);

        self.transport.write(&frame)?;
        expect_ok(&mut self.transport)
    }

    /// Asks the bootloader to compute the CRC-32 of `[address, address+length)`
    /// and compares it against the same CRC computed locally over
    /// `expected_bytes`.
    pub fn crc_internal_flash(&mut self, address: u32, length: u32, expected_bytes: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&length.to_le_bytes());
        issue_command(&mut self.transport, COMMAND_CRC_INTERNAL_FLASH, &payload)?;

        let response = framer::decode_response(&mut self.transport, RESPONSE_CRC_INTERNAL_FLASH, 4)?;
        // A known firmware bug appends two extra bytes after the CRC value;
        // drain and discard them so they don't corrupt the next response.
        let _ = self.transport.read_exact(2)?;

        let remote = u32::from_le_bytes(response.try_into().unwrap());
        let local = crc32(expected_bytes);
        if local != remote {
            return Err(Error::CrcMismatch { local, remote });
        }
        Ok(())
    }

    /// Issues a soft reset, handing control back to the installed
    /// application chain.
    pub fn reset(&mut self) -> Result<()> {
        issue_command(&mut self.transport, COMMAND_RESET, &[])?;
        expect_ok(&mut self.transport)
    }
}

/// Writes the raw 2-byte ping frame (`0xFC, COMMAND_PING`) with no sync
/// preamble. Unlike every other command, `ping` is not routed through
/// [`issue_command`]: the bootloader's ping handler does not expect (and
/// does not need) the receive-buffer reset a sync preamble performs.
fn ping<P: SerialIo>(transport: &mut Transport<P>) -> Result<()> {
    transport.write(&[ESCAPE_CHAR, COMMAND_PING])?;
    let response = framer::decode_response(transport, RESPONSE_PONG, 0);
    match response {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::NoPong),
    }
}

fn issue_command<P: SerialIo>(transport: &mut Transport<P>, command: u8, payload: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(SYNC_MESSAGE.len() + payload.len() + 2);
    frame.extend_from_slice(&SYNC_MESSAGE);
    frame.extend_from_slice(&framer::encode_request(command, payload));
    transport.write(&frame)
}

fn expect_ok<P: SerialIo>(transport: &mut Transport<P>) -> Result<()> {
    let header = transport.read_exact(2)?;
    if header.len() != 2 || header[0] != ESCAPE_CHAR {
        return Err(Error::FramingError {
            got_header: [
                *header.first().unwrap_or(&0),
                *header.get(1).unwrap_or(&0),
            ],
        });
    }
    match header[1] {
        RESPONSE_OK => Ok(()),
        RESPONSE_BAD_ADDR => Err(Error::BadAddress),
        RESPONSE_BAD_ARGS => Err(Error::BadArgs),
        RESPONSE_INTERNAL_ERROR => Err(Error::InternalTargetError),
        other => Err(Error::OpaqueResponse(other)),
    }
}

/// Computes the bootloader's CRC-32 variant: width 32, poly `0x04C11DB7`,
/// init `0`, reflected input/output, final XOR `0xFFFFFFFF`. This differs
/// from the common zlib CRC-32 only in its initial value.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = CRCu32::create_crc(0x04C1_1DB7, 32, 0, 0xFFFF_FFFF, true);
    crc.digest(bytes);
    crc.get_crc()
}
