use crate::error::Error;
use crate::platform::FlashQueue;
use crate::raw::{
    DecodeError, PAGE_HEADER_SIZE, PageHeader, PageState, RECORD_HEADER_SIZE, RecordHeader,
    verify_record,
};
use alloc::vec;
use alloc::vec::Vec;

/// Bytes read at once while checking that a region is erased.
const ERASED_SCAN_CHUNK: usize = 64;

/// Where the page pool lives in flash. Page indices inside the engine are relative to the
/// first page of the pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Layout {
    pub(crate) base_address: u32,
    pub(crate) first_page: u16,
    pub(crate) num_pages: u16,
    pub(crate) page_size: usize,
}

impl Layout {
    pub(crate) fn page_address(&self, page: u16) -> u32 {
        self.base_address + page as u32 * self.page_size as u32
    }

    pub(crate) fn absolute_page(&self, page: u16) -> u16 {
        self.first_page + page
    }
}

/// Location and header of a valid record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RecordRef {
    pub(crate) page: u16,
    pub(crate) offset: usize,
    pub(crate) header: RecordHeader,
}

impl RecordRef {
    pub(crate) fn next_offset(&self) -> usize {
        self.offset + self.header.record_length as usize
    }

    fn is_at(&self, other: &RecordRef) -> bool {
        self.page == other.page && self.offset == other.offset
    }
}

/// Input of a state machine transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    /// The flash queue is drained and the last task of the machine, if any, succeeded.
    Ready,
    /// The last task issued by the machine failed.
    TaskFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FlashTask {
    Write {
        page: u16,
        offset: usize,
        data: Vec<u8>,
    },
    Erase {
        page: u16,
    },
}

/// Side effect requested by a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    /// Issue one flash task and wait for it.
    Task(FlashTask),
    /// Defragment a page first, then advance the requesting machine again.
    Defragment { page: u16, force: bool },
    /// The machine is done.
    Finish(Result<(), Error>),
}

impl Action {
    pub(crate) fn write(page: u16, offset: usize, data: Vec<u8>) -> Self {
        Action::Task(FlashTask::Write { page, offset, data })
    }

    pub(crate) fn erase(page: u16) -> Self {
        Action::Task(FlashTask::Erase { page })
    }
}

/// Read-only view on the page pool. All scans read one page header or one record at a time, so
/// memory usage is bounded by the largest record.
pub(crate) struct Pages<'a, T> {
    hal: &'a mut T,
    layout: Layout,
}

impl<'a, T: FlashQueue> Pages<'a, T> {
    pub(crate) fn new(hal: &'a mut T, layout: Layout) -> Self {
        Self { hal, layout }
    }

    pub(crate) fn num_pages(&self) -> u16 {
        self.layout.num_pages
    }

    fn read(&mut self, page: u16, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.hal
            .read(self.layout.page_address(page) + offset as u32, buf)
    }

    pub(crate) fn page_header(&mut self, page: u16) -> Result<PageHeader, Error> {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        self.read(page, 0, &mut buf)?;
        Ok(PageHeader::decode(buf))
    }

    pub(crate) fn is_active(&mut self, page: u16) -> Result<bool, Error> {
        Ok(self.page_header(page)?.is_active())
    }

    pub(crate) fn page_state(&mut self, page: u16) -> Result<PageState, Error> {
        if self.is_active(page)? {
            Ok(PageState::Active)
        } else if self.is_erased_from(page, 0)? {
            Ok(PageState::Empty)
        } else {
            Ok(PageState::Corrupt)
        }
    }

    /// Checks that every byte from `offset` to the end of the page is erased.
    pub(crate) fn is_erased_from(&mut self, page: u16, offset: usize) -> Result<bool, Error> {
        let mut buf = [0u8; ERASED_SCAN_CHUNK];
        let mut offset = offset;
        while offset < self.layout.page_size {
            let len = ERASED_SCAN_CHUNK.min(self.layout.page_size - offset);
            self.read(page, offset, &mut buf[..len])?;
            if buf[..len].iter().any(|&it| it != 0xFF) {
                return Ok(false);
            }
            offset += len;
        }
        Ok(true)
    }

    /// Returns the record at `offset` if it is valid. The record chain of a page ends at the first
    /// position that does not hold a valid record.
    pub(crate) fn record_at(&mut self, page: u16, offset: usize) -> Result<Option<RecordRef>, Error> {
        if offset + RECORD_HEADER_SIZE > self.layout.page_size {
            return Ok(None);
        }

        let mut raw_header = [0u8; RECORD_HEADER_SIZE];
        self.read(page, offset, &mut raw_header)?;
        if raw_header == [0xFF; RECORD_HEADER_SIZE] {
            return Ok(None);
        }

        let header = match RecordHeader::decode(&raw_header)
            .and_then(|header| header.check_bounds(offset, self.layout.page_size).map(|_| header))
        {
            Ok(header) => header,
            Err(_e) => {
                debug!("page {} @{}: {}", page, offset, _e);
                return Ok(None);
            }
        };

        let mut raw = vec![0u8; header.record_length as usize];
        self.read(page, offset, &mut raw)?;
        match verify_record(&raw) {
            Ok(header) => Ok(Some(RecordRef {
                page,
                offset,
                header,
            })),
            Err(DecodeError::CrcMismatch) => {
                warn!("page {} @{}: record crc mismatch", page, offset);
                Ok(None)
            }
            Err(_e) => {
                debug!("page {} @{}: {}", page, offset, _e);
                Ok(None)
            }
        }
    }

    /// Offset right after the last valid record of a page, where the next record goes.
    pub(crate) fn chain_end(&mut self, page: u16) -> Result<usize, Error> {
        let mut offset = PAGE_HEADER_SIZE;
        while let Some(record) = self.record_at(page, offset)? {
            offset = record.next_offset();
        }
        Ok(offset)
    }

    pub(crate) fn contains_record(&mut self, page: u16, record_id: u16) -> Result<bool, Error> {
        let mut offset = PAGE_HEADER_SIZE;
        while let Some(record) = self.record_at(page, offset)? {
            if record.header.record_id == record_id {
                return Ok(true);
            }
            offset = record.next_offset();
        }
        Ok(false)
    }

    /// Header, data and padding of a record.
    pub(crate) fn read_record(&mut self, record: &RecordRef) -> Result<Vec<u8>, Error> {
        let mut raw = vec![0u8; record.header.record_length as usize];
        self.read(record.page, record.offset, &mut raw)?;
        Ok(raw)
    }

    pub(crate) fn read_data(&mut self, record: &RecordRef) -> Result<Vec<u8>, Error> {
        let mut data = vec![0u8; record.header.data_length()];
        self.read(record.page, record.offset + RECORD_HEADER_SIZE, &mut data)?;
        Ok(data)
    }

    /// The current record for `record_id`: the valid record with the highest version counter
    /// across all active pages. Deactivated records are returned as well.
    pub(crate) fn get_record(&mut self, record_id: u16) -> Result<Option<RecordRef>, Error> {
        let mut result: Option<RecordRef> = None;

        for page in 0..self.layout.num_pages {
            if !self.is_active(page)? {
                continue;
            }

            let mut offset = PAGE_HEADER_SIZE;
            while let Some(record) = self.record_at(page, offset)? {
                if record.header.record_id == record_id
                    && result.is_none_or(|current| record.header.version > current.header.version)
                {
                    result = Some(record);
                }
                offset = record.next_offset();
            }
        }

        Ok(result)
    }

    /// A record survives defragmentation if it is the current one for its id and is either active
    /// or a tombstone that still hides an older version on another page.
    pub(crate) fn is_live(&mut self, record: &RecordRef) -> Result<bool, Error> {
        let Some(current) = self.get_record(record.header.record_id)? else {
            return Ok(false);
        };
        if !current.is_at(record) {
            return Ok(false);
        }
        if record.header.active {
            return Ok(true);
        }

        for page in (0..self.layout.num_pages).filter(|&page| page != record.page) {
            if self.is_active(page)? && self.contains_record(page, record.header.record_id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub(crate) fn free_space_on_page(&mut self, page: u16) -> Result<usize, Error> {
        if !self.is_active(page)? {
            return Ok(0);
        }
        Ok(self.layout.page_size - self.chain_end(page)?)
    }

    /// Free space the page would have if only its live records were kept.
    pub(crate) fn free_space_when_defragmented(&mut self, page: u16) -> Result<usize, Error> {
        if !self.is_active(page)? {
            return Ok(0);
        }

        let mut used = PAGE_HEADER_SIZE;
        let mut offset = PAGE_HEADER_SIZE;
        while let Some(record) = self.record_at(page, offset)? {
            if self.is_live(&record)? {
                used += record.header.record_length as usize;
            }
            offset = record.next_offset();
        }
        Ok(self.layout.page_size - used)
    }

    /// First active page, in pool order, with room for `record_length` bytes at its append point.
    pub(crate) fn find_free_space(
        &mut self,
        record_length: usize,
    ) -> Result<Option<(u16, usize)>, Error> {
        for page in 0..self.layout.num_pages {
            if !self.is_active(page)? {
                continue;
            }
            let end = self.chain_end(page)?;
            if end + record_length <= self.layout.page_size {
                return Ok(Some((page, end)));
            }
        }
        Ok(None)
    }

    /// The active page with the most free space after defragmentation, considering only pages
    /// where defragmentation would reclaim anything.
    pub(crate) fn find_page_to_defragment(&mut self) -> Result<Option<u16>, Error> {
        let mut best: Option<(u16, usize)> = None;

        for page in 0..self.layout.num_pages {
            if !self.is_active(page)? {
                continue;
            }
            let after = self.free_space_when_defragmented(page)?;
            if after <= self.free_space_on_page(page)? {
                continue;
            }
            if best.is_none_or(|(_, most)| after > most) {
                best = Some((page, after));
            }
        }

        Ok(best.map(|(page, _)| page))
    }

    /// The first empty page of the pool.
    pub(crate) fn swap_page(&mut self) -> Result<Option<u16>, Error> {
        for page in 0..self.layout.num_pages {
            if self.page_state(page)? == PageState::Empty {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    /// Highest version counter among active pages, `0` if there is none.
    pub(crate) fn max_active_version(&mut self) -> Result<u16, Error> {
        let mut max = 0;
        for page in 0..self.layout.num_pages {
            let header = self.page_header(page)?;
            if header.is_active() {
                max = max.max(header.version);
            }
        }
        Ok(max)
    }

    pub(crate) fn count_records(&mut self, page: u16) -> Result<u16, Error> {
        let mut count = 0;
        let mut offset = PAGE_HEADER_SIZE;
        while let Some(record) = self.record_at(page, offset)? {
            count += 1;
            offset = record.next_offset();
        }
        Ok(count)
    }
}
