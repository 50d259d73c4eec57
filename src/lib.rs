#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

#[macro_use]
mod logging;

mod defrag;
pub mod error;
mod internal;
mod lock_down;
pub mod platform;
mod queue;
mod raw;
mod repair;
mod save;

extern crate alloc;

pub use platform::{FlashQueue, NorFlashQueue, TaskCompletion, TaskTag};
pub use queue::DEFAULT_QUEUE_CAPACITY;
pub use raw::{PageState, RecordHeader};

use crate::defrag::Defragment;
use crate::error::Error;
use crate::internal::{Action, Event, FlashTask, Layout, Pages};
use crate::lock_down::LockDown;
use crate::queue::OperationQueue;
use crate::raw::{PAGE_HEADER_SIZE, RECORD_ALIGNMENT, RECORD_HEADER_SIZE};
use crate::repair::Repair;
use crate::save::{DeactivateRecord, RecordOperation, SaveRecord};
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Largest supported page size. Record lengths are stored in 16 bits.
const MAX_PAGE_SIZE: usize = 1 << 16;

/// Identifies who is notified about the outcome of an operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Listener(pub u16);

#[derive(strum::Display, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperationKind {
    Save,
    Deactivate,
    LockDown,
}

/// Outcome of a queued operation, published for operations that were given a [`Listener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub kind: OperationKind,
    pub record_id: u16,
    pub result: Result<(), Error>,
    pub listener: Listener,
    /// Opaque value passed in with the operation.
    pub user_type: u32,
    /// Opaque bytes passed in with a save, empty for other operations.
    pub user_data: Vec<u8>,
}

/// Why the storage asks the application to reboot the device.
#[derive(strum::FromRepr, strum::Display, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RebootReason {
    /// All records have been cleared after a lock-down.
    FactoryReset = 1,
    /// The lock-down erase failed repeatedly.
    LockDownFailed = 2,
    /// The page pool could not be repaired.
    RepairFailed = 3,
}

/// Placement and sizing of the page pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Flash address of the first page, aligned to the page size.
    pub base_address: u32,
    /// Number of pages in the pool, one of them is kept empty as swap page.
    pub num_pages: u16,
    /// Bytes the operation queue may hold, see [`DEFAULT_QUEUE_CAPACITY`].
    pub queue_capacity: usize,
}

impl Config {
    pub const fn new(base_address: u32, num_pages: u16) -> Self {
        Self {
            base_address,
            num_pages,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub const fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordStorageStatistics {
    pub pages: PageStatistics,
    pub pages_detail: Vec<PageInfo>,
    pub pending_operations: usize,
    pub queued_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageStatistics {
    pub empty: u16,
    pub active: u16,
    pub corrupt: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageInfo {
    pub state: PageState,
    /// Version counter of an active page.
    pub version: Option<u16>,
    pub records: u16,
    pub free_bytes: usize,
    /// Additional bytes a defragmentation of this page would free.
    pub reclaimable_bytes: usize,
}

/// Record storage on a pool of flash pages with a single swap page.
///
/// Every record lives in an append-only chain on one of the active pages; a newer version of a
/// record is appended and supersedes the older one by its higher version counter. When no page
/// has room left, the page with the most garbage is compacted into the swap page.
///
/// Operations are queued and executed by feeding the flash task completions back into the storage,
/// see [`RecordStorage::process`]. The storage never issues a flash task while the flash queue
/// still holds one.
pub struct RecordStorage<T: FlashQueue> {
    pub(crate) hal: T,
    pub(crate) layout: Layout,
    pub(crate) queue: OperationQueue,
    pub(crate) repair: Option<Repair>,
    pub(crate) defrag: Option<Defragment>,
    pub(crate) lock_down: Option<LockDown>,
    pub(crate) completions: VecDeque<Completion>,
    pub(crate) reboot: Option<RebootReason>,
    pub(crate) reboot_reported: bool,
    pub(crate) initialized: bool,
}

impl<T: FlashQueue> RecordStorage<T> {
    /// Validates the configuration and starts the repair of the page pool. Records can be queued
    /// right away, they are executed once the repair has finished.
    pub fn new(config: Config, hal: T) -> Result<Self, Error> {
        let page_size = hal.page_size();
        if page_size < PAGE_HEADER_SIZE + RECORD_HEADER_SIZE
            || page_size > MAX_PAGE_SIZE
            || !page_size.is_multiple_of(RECORD_ALIGNMENT)
        {
            return Err(Error::InvalidPageSize);
        }

        if !(config.base_address as usize).is_multiple_of(page_size) {
            return Err(Error::InvalidBaseAddress);
        }

        if config.num_pages < 2 {
            return Err(Error::InvalidPageCount);
        }

        let first_page = config.base_address as usize / page_size;
        if first_page + config.num_pages as usize > u16::MAX as usize + 1 {
            return Err(Error::InvalidBaseAddress);
        }

        debug!(
            "record storage: {} pages of {} bytes at {:#x}",
            config.num_pages, page_size, config.base_address
        );

        let mut storage = Self {
            hal,
            layout: Layout {
                base_address: config.base_address,
                first_page: first_page as u16,
                num_pages: config.num_pages,
                page_size,
            },
            queue: OperationQueue::new(config.queue_capacity),
            repair: Some(Repair::new(false)),
            defrag: None,
            lock_down: None,
            completions: VecDeque::new(),
            reboot: None,
            reboot_reported: false,
            initialized: false,
        };
        storage.drive();
        Ok(storage)
    }

    /// Whether the startup repair has finished and queued operations are executed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_locked_down(&self) -> bool {
        self.lock_down.is_some()
    }

    /// Queues a new version of a record.
    ///
    /// Fails with [`Error::Busy`] if the operation queue is full and with [`Error::LockDown`]
    /// while a lock-down requested by a different listener is in progress. The final result is
    /// published as [`Completion`] if a listener is given.
    pub fn save_record(
        &mut self,
        record_id: u16,
        data: &[u8],
        listener: Option<Listener>,
        user_type: u32,
    ) -> Result<(), Error> {
        self.save_record_with_user_data(record_id, data, listener, user_type, &[])
    }

    /// Like [`RecordStorage::save_record`], `user_data` is handed back in the [`Completion`].
    pub fn save_record_with_user_data(
        &mut self,
        record_id: u16,
        data: &[u8],
        listener: Option<Listener>,
        user_type: u32,
        user_data: &[u8],
    ) -> Result<(), Error> {
        self.check_lock_down(listener)?;
        self.queue.push(
            record_id,
            listener,
            user_type,
            RecordOperation::Save(SaveRecord::new(data.to_vec(), user_data.to_vec())),
        )?;
        self.drive();
        Ok(())
    }

    /// Queues the deactivation of a record. Deactivating a missing or already deactivated record
    /// succeeds without touching the flash.
    pub fn deactivate_record(
        &mut self,
        record_id: u16,
        listener: Option<Listener>,
        user_type: u32,
    ) -> Result<(), Error> {
        self.check_lock_down(listener)?;
        self.queue.push(
            record_id,
            listener,
            user_type,
            RecordOperation::Deactivate(DeactivateRecord::new()),
        )?;
        self.drive();
        Ok(())
    }

    /// Header of the current record for `record_id`, deactivated records included.
    pub fn get_record(&mut self, record_id: u16) -> Result<Option<RecordHeader>, Error> {
        let record = self.pages().get_record(record_id)?;
        Ok(record.map(|it| it.header))
    }

    /// Data of the current record for `record_id` if it is active.
    pub fn get_record_data(&mut self, record_id: u16) -> Result<Vec<u8>, Error> {
        let mut pages = self.pages();
        match pages.get_record(record_id)? {
            Some(record) if record.header.active => pages.read_data(&record),
            _ => Err(Error::RecordNotFound),
        }
    }

    /// Next published operation result, oldest first.
    pub fn poll_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    /// Set once the storage needs the device to reboot. Only the first request is kept.
    pub fn reboot_request(&self) -> Option<RebootReason> {
        self.reboot
    }

    /// Like [`RecordStorage::reboot_request`], but returns the request only once.
    pub fn take_reboot_request(&mut self) -> Option<RebootReason> {
        if self.reboot_reported {
            return None;
        }
        self.reboot_reported = self.reboot.is_some();
        self.reboot
    }

    /// Number of operations that have been queued but not completed yet.
    pub fn pending_operations(&self) -> usize {
        self.queue.len()
    }

    /// Routes the completion of a flash task to the machine that issued it and advances the
    /// storage.
    pub fn on_task_completed(&mut self, completion: TaskCompletion) {
        trace!("task completed: {:?}", completion);
        let failed = completion.result.is_err();

        match completion.tag {
            TaskTag::Operation(ticket) => {
                if let Some(operation) = self.queue.front_mut()
                    && operation.ticket == ticket
                {
                    operation.task_failed |= failed;
                }
            }
            TaskTag::Repair => {
                if let Some(repair) = self.repair.as_mut() {
                    repair.task_failed |= failed;
                }
            }
            TaskTag::Defragment => {
                if let Some(defrag) = self.defrag.as_mut() {
                    defrag.task_failed |= failed;
                }
            }
            TaskTag::LockDown => self.on_lock_down_erased(completion.result),
        }

        self.drive();
    }

    /// Advances the storage once the flash queue has run dry.
    pub fn on_queue_empty(&mut self) {
        self.drive();
    }

    /// Executes the next flash task, if any, and feeds its completion back. Returns `false` once
    /// there is nothing left to do.
    pub fn process(&mut self) -> bool {
        let Some(completion) = self.hal.poll() else {
            return false;
        };

        self.on_task_completed(completion);
        if self.hal.active_tasks() == 0 {
            self.on_queue_empty();
        }
        true
    }

    /// Calls [`RecordStorage::process`] until all queued work is done.
    pub fn run_until_idle(&mut self) {
        while self.process() {}
    }

    /// Returns detailed statistics about the page pool.
    pub fn statistics(&mut self) -> Result<RecordStorageStatistics, Error> {
        let mut page_stats = PageStatistics {
            empty: 0,
            active: 0,
            corrupt: 0,
        };

        let mut pages = Pages::new(&mut self.hal, self.layout);
        let mut pages_detail = Vec::with_capacity(self.layout.num_pages as usize);
        for page in 0..self.layout.num_pages {
            let state = pages.page_state(page)?;
            let info = match state {
                PageState::Active => {
                    page_stats.active += 1;
                    let free_bytes = pages.free_space_on_page(page)?;
                    PageInfo {
                        state,
                        version: Some(pages.page_header(page)?.version),
                        records: pages.count_records(page)?,
                        free_bytes,
                        reclaimable_bytes: pages
                            .free_space_when_defragmented(page)?
                            .saturating_sub(free_bytes),
                    }
                }
                PageState::Empty | PageState::Corrupt => {
                    if state == PageState::Empty {
                        page_stats.empty += 1;
                    } else {
                        page_stats.corrupt += 1;
                    }
                    PageInfo {
                        state,
                        version: None,
                        records: 0,
                        free_bytes: 0,
                        reclaimable_bytes: 0,
                    }
                }
            };
            pages_detail.push(info);
        }

        Ok(RecordStorageStatistics {
            pages: page_stats,
            pages_detail,
            pending_operations: self.queue.len(),
            queued_bytes: self.queue.used_bytes(),
        })
    }

    pub fn into_inner(self) -> T {
        self.hal
    }

    fn pages(&mut self) -> Pages<'_, T> {
        Pages::new(&mut self.hal, self.layout)
    }

    fn check_lock_down(&self, listener: Option<Listener>) -> Result<(), Error> {
        match &self.lock_down {
            Some(lock_down) if Some(lock_down.owner) != listener => Err(Error::LockDown),
            _ => Ok(()),
        }
    }

    pub(crate) fn publish(&mut self, completion: Option<Completion>) {
        if let Some(completion) = completion {
            trace!(
                "completion for listener {}: {} record {} {:?}",
                completion.listener.0, completion.kind, completion.record_id, completion.result
            );
            self.completions.push_back(completion);
        }
    }

    pub(crate) fn request_reboot(&mut self, reason: RebootReason) {
        if self.reboot.is_none() {
            warn!("reboot requested: {}", reason);
            self.reboot = Some(reason);
        }
    }

    /// Advances the state machines until one of them waits for a flash task or there is nothing
    /// left to do. Defragmentation runs before the repair, the repair before queued operations.
    pub(crate) fn drive(&mut self) {
        loop {
            if self.hal.active_tasks() != 0 {
                return;
            }
            if self.lock_down.as_ref().is_some_and(|it| it.erasing) {
                return;
            }

            if self.defrag.is_some() {
                self.step_defragment();
            } else if self.repair.is_some() {
                self.step_repair();
            } else if self.initialized && !self.queue.is_empty() {
                self.step_operation();
            } else {
                return;
            }
        }
    }

    fn issue(&mut self, task: FlashTask, tag: TaskTag) -> Result<(), Error> {
        match task {
            FlashTask::Write { page, offset, data } => {
                let address = self.layout.page_address(page) + offset as u32;
                self.hal.cache_and_write(address, &data, tag)
            }
            FlashTask::Erase { page } => self.hal.erase_page(self.layout.absolute_page(page), tag),
        }
    }

    fn start_defragment(&mut self, page: u16, force: bool, requester: TaskTag) {
        let started = Defragment::start(
            page,
            force,
            requester,
            &mut Pages::new(&mut self.hal, self.layout),
        );
        match started {
            Ok(defrag) => self.defrag = defrag,
            Err(_e) => error!("defragment page {}: {}", page, _e),
        }
    }

    fn step_defragment(&mut self) {
        let Some(defrag) = self.defrag.as_mut() else {
            return;
        };
        let event = take_event(&mut defrag.task_failed);
        let action = defrag
            .advance(event, &mut Pages::new(&mut self.hal, self.layout))
            .unwrap_or_else(|e| Action::Finish(Err(e)));

        match action {
            Action::Task(task) => {
                if self.issue(task, TaskTag::Defragment).is_err()
                    && let Some(defrag) = self.defrag.as_mut()
                {
                    defrag.task_failed = true;
                }
            }
            Action::Finish(result) => {
                let Some(defrag) = self.defrag.take() else {
                    return;
                };
                match result {
                    Ok(()) => {}
                    // the swap page has been erased again, the pool is consistent
                    Err(Error::NoSpace) => warn!("defragmentation refused: page versions exhausted"),
                    Err(_e) => {
                        error!("defragmentation failed: {}", _e);
                        self.on_defragment_failed(defrag.requester);
                    }
                }
            }
            // defragmentation never nests
            Action::Defragment { .. } => self.defrag = None,
        }
    }

    /// Fails the machine waiting for the defragmentation and schedules a repair. The source page
    /// still holds every live record, the repair turns one page back into the swap page.
    fn on_defragment_failed(&mut self, requester: TaskTag) {
        match requester {
            TaskTag::Operation(ticket) => {
                if let Some(operation) = self.queue.front_mut()
                    && operation.ticket == ticket
                {
                    operation.task_failed = true;
                }
            }
            TaskTag::Repair => {
                if let Some(repair) = self.repair.as_mut() {
                    repair.task_failed = true;
                }
            }
            TaskTag::Defragment | TaskTag::LockDown => {}
        }

        if self.repair.is_none() {
            self.repair = Some(Repair::new(false));
        }
    }

    fn step_repair(&mut self) {
        let Some(repair) = self.repair.as_mut() else {
            return;
        };
        let event = take_event(&mut repair.task_failed);
        let action = repair
            .advance(event, &mut Pages::new(&mut self.hal, self.layout))
            .unwrap_or_else(|e| Action::Finish(Err(e)));

        match action {
            Action::Task(task) => {
                if self.issue(task, TaskTag::Repair).is_err()
                    && let Some(repair) = self.repair.as_mut()
                {
                    repair.task_failed = true;
                }
            }
            Action::Defragment { page, force } => {
                self.start_defragment(page, force, TaskTag::Repair)
            }
            Action::Finish(result) => {
                if let Some(repair) = self.repair.take() {
                    self.finish_repair(repair, result);
                }
            }
        }
    }

    fn finish_repair(&mut self, repair: Repair, result: Result<(), Error>) {
        if let Err(_e) = result {
            error!("repair failed: {}", _e);
            self.request_reboot(RebootReason::RepairFailed);
        }

        self.initialized = true;
        if repair.after_lock_down {
            self.finish_lock_down(Ok(()));
            self.request_reboot(RebootReason::FactoryReset);
        }
    }

    fn step_operation(&mut self) {
        let Some(operation) = self.queue.front_mut() else {
            return;
        };
        let event = take_event(&mut operation.task_failed);
        let tag = TaskTag::Operation(operation.ticket);
        let action = operation
            .machine
            .advance(
                operation.record_id,
                event,
                &mut Pages::new(&mut self.hal, self.layout),
            )
            .unwrap_or_else(|_e| {
                error!("record {}: {}", operation.record_id, _e);
                Action::Finish(Err(Error::Busy))
            });

        match action {
            Action::Task(task) => {
                if self.issue(task, tag).is_err()
                    && let Some(operation) = self.queue.front_mut()
                {
                    operation.task_failed = true;
                }
            }
            Action::Defragment { page, force } => self.start_defragment(page, force, tag),
            Action::Finish(result) => {
                if let Some(operation) = self.queue.pop_front() {
                    debug!(
                        "{} record {} finished: {:?}",
                        operation.kind(),
                        operation.record_id,
                        result
                    );
                    let completion = operation.into_completion(result);
                    self.publish(completion);
                }
            }
        }
    }
}

fn take_event(task_failed: &mut bool) -> Event {
    if core::mem::take(task_failed) {
        Event::TaskFailed
    } else {
        Event::Ready
    }
}
