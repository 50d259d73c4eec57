//! The flash write queue the engine drives, and an implementation of it for any
//! [`NorFlash`](embedded_storage::nor_flash::NorFlash) device.

use crate::error::Error;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use embedded_storage::nor_flash::NorFlash;

/// Number of times [`NorFlashQueue`] repeats a failed task before reporting the failure.
pub const DEFAULT_RETRY_COUNT: u8 = 3;

/// Number of tasks [`NorFlashQueue`] accepts before answering with [`Error::QueueFull`].
pub const DEFAULT_TASK_CAPACITY: usize = 8;

/// Names the part of the engine that issued a flash task so its completion can be routed back.
/// Completions of work that has been cancelled in the meantime are ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskTag {
    /// A queued save or deactivate operation, identified by its ticket.
    Operation(u32),
    Repair,
    Defragment,
    LockDown,
}

/// Result of a single executed flash task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskCompletion {
    pub tag: TaskTag,
    pub result: Result<(), Error>,
}

/// Asynchronous flash write queue consumed by [`RecordStorage`](crate::RecordStorage).
///
/// Tasks execute one after another in the order they were queued. Reads are synchronous and must
/// reflect every task that has completed. Page indices are absolute, i.e. the page at flash
/// address `0` has index `0`.
pub trait FlashQueue {
    /// Size of one erase unit in bytes.
    fn page_size(&self) -> usize;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error>;

    /// Copies `data` into the queue and programs it at `offset` later.
    fn cache_and_write(&mut self, offset: u32, data: &[u8], tag: TaskTag) -> Result<(), Error>;

    fn erase_page(&mut self, page: u16, tag: TaskTag) -> Result<(), Error> {
        self.erase_pages(page, 1, tag)
    }

    fn erase_pages(&mut self, first_page: u16, count: u16, tag: TaskTag) -> Result<(), Error>;

    /// Number of queued or executing tasks. The engine never advances while this is not zero.
    fn active_tasks(&self) -> usize;

    /// Returns the completion of the next finished task, if any.
    fn poll(&mut self) -> Option<TaskCompletion>;
}

impl<T: FlashQueue> FlashQueue for &mut T {
    fn page_size(&self) -> usize {
        T::page_size(self)
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        T::read(self, offset, bytes)
    }

    fn cache_and_write(&mut self, offset: u32, data: &[u8], tag: TaskTag) -> Result<(), Error> {
        T::cache_and_write(self, offset, data, tag)
    }

    fn erase_page(&mut self, page: u16, tag: TaskTag) -> Result<(), Error> {
        T::erase_page(self, page, tag)
    }

    fn erase_pages(&mut self, first_page: u16, count: u16, tag: TaskTag) -> Result<(), Error> {
        T::erase_pages(self, first_page, count, tag)
    }

    fn active_tasks(&self) -> usize {
        T::active_tasks(self)
    }

    fn poll(&mut self) -> Option<TaskCompletion> {
        T::poll(self)
    }
}

pub(crate) trait AlignedOps: NorFlash {
    fn align_read_floor(offset: usize) -> usize {
        align_floor(offset, Self::READ_SIZE)
    }

    fn align_read_ceil(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }
}

impl<T: NorFlash> AlignedOps for T {}

#[inline(always)]
pub(crate) const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
pub(crate) const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

enum Command {
    Write { offset: u32, data: Vec<u8> },
    Erase { first_page: u16, count: u16 },
}

struct Task {
    command: Command,
    tag: TaskTag,
}

/// [`FlashQueue`] on top of a blocking [`NorFlash`] device. A task executes when it is polled,
/// which makes the queue usable both on target, from a main loop, and in host tests.
///
/// The engine only issues 4-byte aligned writes, so the device's `WRITE_SIZE` has to divide 4.
pub struct NorFlashQueue<F> {
    flash: F,
    tasks: VecDeque<Task>,
    capacity: usize,
    retries: u8,
}

impl<F: NorFlash> NorFlashQueue<F> {
    pub fn new(flash: F) -> Self {
        const {
            assert!(
                crate::raw::RECORD_ALIGNMENT.is_multiple_of(F::WRITE_SIZE),
                "flash write size must divide the record alignment"
            )
        };

        Self {
            flash,
            tasks: VecDeque::new(),
            capacity: DEFAULT_TASK_CAPACITY,
            retries: DEFAULT_RETRY_COUNT,
        }
    }

    /// How often a failed task is repeated before its failure is reported.
    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    /// How many tasks can be queued at once.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn flash(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn push(&mut self, command: Command, tag: TaskTag) -> Result<(), Error> {
        if self.tasks.len() >= self.capacity {
            return Err(Error::QueueFull);
        }
        self.tasks.push_back(Task { command, tag });
        Ok(())
    }

    fn execute(&mut self, command: &Command) -> Result<(), F::Error> {
        match command {
            Command::Write { offset, data } => {
                trace!("flash queue: write @{:#x} [{}]", offset, data.len());
                self.flash.write(*offset, data)
            }
            Command::Erase { first_page, count } => {
                trace!("flash queue: erase pages {} + {}", first_page, count);
                let from = *first_page as u32 * F::ERASE_SIZE as u32;
                let to = from + *count as u32 * F::ERASE_SIZE as u32;
                self.flash.erase(from, to)
            }
        }
    }
}

impl<F: NorFlash> FlashQueue for NorFlashQueue<F> {
    fn page_size(&self) -> usize {
        F::ERASE_SIZE
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        let offset = offset as usize;
        let start = F::align_read_floor(offset);
        let end = F::align_read_ceil(offset + bytes.len());

        if start == offset && end == offset + bytes.len() {
            return self
                .flash
                .read(offset as u32, bytes)
                .map_err(|_| Error::FlashError);
        }

        let mut buf = vec![0u8; end - start];
        self.flash
            .read(start as u32, &mut buf)
            .map_err(|_| Error::FlashError)?;
        bytes.copy_from_slice(&buf[offset - start..offset - start + bytes.len()]);
        Ok(())
    }

    fn cache_and_write(&mut self, offset: u32, data: &[u8], tag: TaskTag) -> Result<(), Error> {
        self.push(
            Command::Write {
                offset,
                data: data.to_vec(),
            },
            tag,
        )
    }

    fn erase_pages(&mut self, first_page: u16, count: u16, tag: TaskTag) -> Result<(), Error> {
        self.push(Command::Erase { first_page, count }, tag)
    }

    fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn poll(&mut self) -> Option<TaskCompletion> {
        let task = self.tasks.pop_front()?;

        let mut attempt = 0;
        let result = loop {
            match self.execute(&task.command) {
                Ok(()) => break Ok(()),
                Err(_) if attempt < self.retries => {
                    attempt += 1;
                    warn!("flash queue: task failed, retry {} of {}", attempt, self.retries);
                }
                Err(_) => {
                    error!("flash queue: task failed after {} retries", self.retries);
                    break Err(Error::FlashError);
                }
            }
        };

        Some(TaskCompletion {
            tag: task.tag,
            result,
        })
    }
}
