#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use crc::{CRC_8_MAXIM_DOW, Crc};
use record_storage::{Completion, Config, NorFlashQueue, RecordStorage};

pub const PAGE_SIZE: usize = 256;
pub const WORD_SIZE: usize = 4;
pub const PAGE_HEADER_SIZE: usize = 4;
pub const RECORD_HEADER_SIZE: usize = 8;

pub type Storage<'a, const P: usize = PAGE_SIZE> = RecordStorage<NorFlashQueue<&'a mut Flash<P>>>;

/// NOR flash simulation: writes can only flip bits from 1 to 0, erases set whole pages to `0xFF`.
///
/// Faults are injected on mutations only, reads always work:
///  * `fail_next(n)` lets the next `n` writes or erases fail without touching the content
///  * `fail_erases(n)` does the same for the next `n` erases only
///  * `cut_power_after(n)` applies the next `n` writes or erases, half applies the one after and
///    fails every mutation from then on until `restore_power` is called
pub struct Flash<const P: usize = PAGE_SIZE> {
    pub buf: Vec<u8>,
    pub operations: Vec<Operation>,
    failures: usize,
    erase_failures: usize,
    power_left: Option<usize>,
    powered: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl<const P: usize> Flash<P> {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xffu8; P * pages],
            operations: Vec::new(),
            failures: 0,
            erase_failures: 0,
            power_left: None,
            powered: true,
        }
    }

    pub fn fail_next(&mut self, count: usize) {
        self.failures = count;
    }

    pub fn fail_erases(&mut self, count: usize) {
        self.erase_failures = count;
    }

    pub fn cut_power_after(&mut self, mutations: usize) {
        self.power_left = Some(mutations);
    }

    pub fn restore_power(&mut self) {
        self.power_left = None;
        self.powered = true;
        self.failures = 0;
        self.erase_failures = 0;
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn page(&self, page: usize) -> &[u8] {
        &self.buf[page * P..(page + 1) * P]
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    /// Decides the fate of the next mutation: `Ok(true)` applies it completely, `Ok(false)` only
    /// half of it.
    fn admit(&mut self) -> Result<bool, FlashError> {
        if !self.powered {
            println!("    flash: NO POWER");
            return Err(FlashError);
        }
        if self.failures > 0 {
            self.failures -= 1;
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        match self.power_left {
            Some(0) => {
                println!("    flash: POWER CUT");
                self.powered = false;
                Ok(false)
            }
            Some(left) => {
                self.power_left = Some(left - 1);
                Ok(true)
            }
            None => Ok(true),
        }
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl<const P: usize> ErrorType for Flash<P> {
    type Error = FlashError;
}

impl<const P: usize> ReadNorFlash for Flash<P> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl<const P: usize> NorFlash for Flash<P> {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = P;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to as usize <= self.buf.len());

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if self.erase_failures > 0 {
            self.erase_failures -= 1;
            println!("    flash: ERASE FAULT");
            return Err(FlashError);
        }

        let complete = self.admit()?;
        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        let to = if complete { to } else { from + (to - from) / 2 };
        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }

        if complete { Ok(()) } else { Err(FlashError) }
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(!bytes.is_empty());

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        let complete = self.admit()?;
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let len = if complete {
            bytes.len()
        } else {
            bytes.len() / 2 / WORD_SIZE * WORD_SIZE
        };

        let offset = offset as usize;
        for (i, &val) in bytes[..len].iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }

        if complete { Ok(()) } else { Err(FlashError) }
    }
}

/// CRC of a record, for records patched directly in the flash buffer.
pub fn record_crc(record: &[u8]) -> u8 {
    Crc::<u8>::new(&CRC_8_MAXIM_DOW).checksum(&record[2..])
}

/// Creates the storage on the whole flash and waits for the startup repair.
pub fn init<const P: usize>(flash: &mut Flash<P>, pages: u16) -> Storage<'_, P> {
    init_with(flash, Config::new(0, pages))
}

pub fn init_with<const P: usize>(flash: &mut Flash<P>, config: Config) -> Storage<'_, P> {
    let mut storage = RecordStorage::new(config, NorFlashQueue::new(flash)).unwrap();
    storage.run_until_idle();
    assert!(storage.is_initialized());
    storage
}

pub fn completions<const P: usize>(storage: &mut Storage<'_, P>) -> Vec<Completion> {
    std::iter::from_fn(|| storage.poll_completion()).collect()
}
