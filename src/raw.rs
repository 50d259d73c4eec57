//! Bit-exact layout of pages and records as they are persisted in flash.
//!
//! Page header (4 bytes, little endian):
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 0      | 2    | magic (`0xAC71`) |
//! | 2      | 2    | version counter  |
//!
//! Record header (8 bytes, little endian), followed by the data and 0-3 bytes of `0xFF` padding:
//!
//! | offset | size | field                                                    |
//! |--------|------|----------------------------------------------------------|
//! | 0      | 1    | CRC-8 over bytes `2..record_length`                      |
//! | 1      | 1    | flags: bit 7 active, bits 5-6 padding, bits 0-4 reserved |
//! | 2      | 2    | record length (header + data + padding)                  |
//! | 4      | 2    | record id                                                |
//! | 6      | 2    | version counter                                          |
//!
//! The flags byte is not covered by the CRC so that deactivating a record, which only clears
//! the active bit, keeps the record valid.

use crate::platform::align_ceil;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{Debug, Formatter};
use crc::{CRC_8_MAXIM_DOW, Crc};
use thiserror::Error;

pub(crate) const ACTIVE_PAGE_MAGIC: u16 = 0xAC71;
pub(crate) const PAGE_HEADER_SIZE: usize = 4;
pub(crate) const RECORD_HEADER_SIZE: usize = 8;
pub(crate) const RECORD_ALIGNMENT: usize = 4;

/// Highest version counter a page may be activated with. `u16::MAX` is what an interrupted
/// header write leaves behind, so it never marks an active page.
pub(crate) const MAX_PAGE_VERSION: u16 = u16::MAX - 1;
pub(crate) const PAGE_VERSION_WARN_THRESHOLD: u16 = MAX_PAGE_VERSION - 1000;

const FLAGS_RESERVED: u8 = 0b0001_1111;
const FLAGS_PADDING_SHIFT: u8 = 5;
const FLAGS_PADDING_MASK: u8 = 0b0110_0000;
const FLAGS_ACTIVE: u8 = 0b1000_0000;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);

pub(crate) fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Errors while interpreting persisted bytes. Any of them ends the record chain of a page.
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum DecodeError {
    #[error("truncated buffer")]
    Truncated,

    #[error("record length out of bounds")]
    LengthOutOfBounds,

    #[error("crc mismatch")]
    CrcMismatch,
}

/// State of a page, derived from its header and, for pages without a valid header, its content.
#[derive(strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageState {
    /// Every byte is erased. Exactly one such page is kept as the swap page.
    Empty,
    /// The page carries the active magic and a usable version counter.
    Active,
    /// Neither erased nor active, e.g. after power loss during an erase or a page copy.
    Corrupt,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct PageHeader {
    pub(crate) magic: u16,
    pub(crate) version: u16,
}

impl PageHeader {
    pub(crate) const fn active(version: u16) -> Self {
        Self {
            magic: ACTIVE_PAGE_MAGIC,
            version,
        }
    }

    pub(crate) fn decode(raw: [u8; PAGE_HEADER_SIZE]) -> Self {
        let [m0, m1, v0, v1] = raw;
        Self {
            magic: u16::from_le_bytes([m0, m1]),
            version: u16::from_le_bytes([v0, v1]),
        }
    }

    pub(crate) fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let [m0, m1] = self.magic.to_le_bytes();
        let [v0, v1] = self.version.to_le_bytes();
        [m0, m1, v0, v1]
    }

    pub(crate) fn is_active(&self) -> bool {
        self.magic == ACTIVE_PAGE_MAGIC && self.version != u16::MAX
    }
}

impl Debug for PageHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!(
            "PageHeader {{ magic: 0x{:0>4x}, version: {} }}",
            self.magic, self.version
        ))
    }
}

/// Header of a record as found in flash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordHeader {
    pub crc: u8,
    /// Cleared by a deactivation. An inactive record is a tombstone.
    pub active: bool,
    /// Number of `0xFF` bytes appended to the data to reach a multiple of 4.
    pub padding: u8,
    /// Length of the whole record: header, data and padding.
    pub record_length: u16,
    pub record_id: u16,
    pub version: u16,
}

impl RecordHeader {
    pub(crate) fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let raw: &[u8; RECORD_HEADER_SIZE] = raw
            .get(..RECORD_HEADER_SIZE)
            .and_then(|it| it.try_into().ok())
            .ok_or(DecodeError::Truncated)?;

        let [crc, flags, l0, l1, i0, i1, v0, v1] = *raw;
        Ok(Self {
            crc,
            active: flags & FLAGS_ACTIVE != 0,
            padding: (flags & FLAGS_PADDING_MASK) >> FLAGS_PADDING_SHIFT,
            record_length: u16::from_le_bytes([l0, l1]),
            record_id: u16::from_le_bytes([i0, i1]),
            version: u16::from_le_bytes([v0, v1]),
        })
    }

    pub(crate) fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut flags = FLAGS_RESERVED | ((self.padding << FLAGS_PADDING_SHIFT) & FLAGS_PADDING_MASK);
        if self.active {
            flags |= FLAGS_ACTIVE;
        }
        let [l0, l1] = self.record_length.to_le_bytes();
        let [i0, i1] = self.record_id.to_le_bytes();
        let [v0, v1] = self.version.to_le_bytes();
        [self.crc, flags, l0, l1, i0, i1, v0, v1]
    }

    /// Length of the payload without header and padding.
    pub fn data_length(&self) -> usize {
        (self.record_length as usize)
            .saturating_sub(RECORD_HEADER_SIZE)
            .saturating_sub(self.padding as usize)
    }

    /// Checks that a record with this header fits at `offset` into a page of `page_size` bytes.
    pub(crate) fn check_bounds(&self, offset: usize, page_size: usize) -> Result<(), DecodeError> {
        let length = self.record_length as usize;
        if length < RECORD_HEADER_SIZE
            || !length.is_multiple_of(RECORD_ALIGNMENT)
            || length - RECORD_HEADER_SIZE < self.padding as usize
            || offset + length > page_size
        {
            return Err(DecodeError::LengthOutOfBounds);
        }
        Ok(())
    }
}

/// Decodes and verifies a complete record, header included.
pub(crate) fn verify_record(record: &[u8]) -> Result<RecordHeader, DecodeError> {
    let header = RecordHeader::decode(record)?;
    if header.record_length as usize != record.len() {
        return Err(DecodeError::Truncated);
    }
    if crc8(&record[2..]) != header.crc {
        return Err(DecodeError::CrcMismatch);
    }
    Ok(header)
}

/// Size a record with `data_length` bytes of payload occupies in flash.
pub(crate) fn padded_record_length(data_length: usize) -> usize {
    align_ceil(data_length + RECORD_HEADER_SIZE, RECORD_ALIGNMENT)
}

/// Builds an active record ready to be written. The caller guarantees that the record fits into a
/// page, which also keeps its length within `u16`.
pub(crate) fn build_record(record_id: u16, version: u16, data: &[u8]) -> Vec<u8> {
    let record_length = padded_record_length(data.len());
    debug_assert!(record_length <= u16::MAX as usize);

    let mut header = RecordHeader {
        crc: 0xFF,
        active: true,
        padding: (record_length - RECORD_HEADER_SIZE - data.len()) as u8,
        record_length: record_length as u16,
        record_id,
        version,
    };

    let mut buf = vec![0xFFu8; record_length];
    buf[..RECORD_HEADER_SIZE].copy_from_slice(&header.encode());
    buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + data.len()].copy_from_slice(data);

    header.crc = crc8(&buf[2..]);
    buf[0] = header.crc;
    buf
}

/// Header overwrite that turns a record into a tombstone. Every bit but the active flag is left
/// untouched because writing ones is a no-op on flash.
pub(crate) const fn tombstone_header() -> [u8; RECORD_HEADER_SIZE] {
    let mut raw = [0xFFu8; RECORD_HEADER_SIZE];
    raw[1] = !FLAGS_ACTIVE;
    raw
}
