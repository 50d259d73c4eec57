use crate::error::Error;
use crate::internal::{Action, Event, Pages};
use crate::platform::FlashQueue;
use crate::raw::{build_record, padded_record_length, tombstone_header};
use alloc::vec::Vec;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SaveState {
    DefragmentIfNeeded,
    Save,
    Finish,
}

/// Appends a new version of a record, defragmenting one page first if no active page has room.
#[derive(Debug)]
pub(crate) struct SaveRecord {
    pub(crate) data: Vec<u8>,
    pub(crate) user_data: Vec<u8>,
    state: SaveState,
}

impl SaveRecord {
    pub(crate) fn new(data: Vec<u8>, user_data: Vec<u8>) -> Self {
        Self {
            data,
            user_data,
            state: SaveState::DefragmentIfNeeded,
        }
    }

    fn advance<T: FlashQueue>(
        &mut self,
        record_id: u16,
        event: Event,
        pages: &mut Pages<'_, T>,
    ) -> Result<Action, Error> {
        if event == Event::TaskFailed {
            warn!("save record {}: flash task failed", record_id);
            return Ok(Action::Finish(Err(Error::Busy)));
        }

        let record_length = padded_record_length(self.data.len());

        loop {
            match self.state {
                SaveState::DefragmentIfNeeded => {
                    debug!("save record {} [{}]", record_id, self.data.len());
                    self.state = SaveState::Save;

                    if pages.find_free_space(record_length)?.is_none()
                        && let Some(page) = pages.find_page_to_defragment()?
                    {
                        return Ok(Action::Defragment { page, force: false });
                    }
                }
                SaveState::Save => return self.save(record_id, record_length, pages),
                SaveState::Finish => return Ok(Action::Finish(Ok(()))),
            }
        }
    }

    fn save<T: FlashQueue>(
        &mut self,
        record_id: u16,
        record_length: usize,
        pages: &mut Pages<'_, T>,
    ) -> Result<Action, Error> {
        let Some((page, offset)) = pages.find_free_space(record_length)? else {
            error!("save record {}: no space for {} bytes", record_id, record_length);
            for page in 0..pages.num_pages() {
                let _free = pages.free_space_when_defragmented(page)?;
                error!("  page {}: {} bytes free after defragmentation", page, _free);
            }
            return Ok(Action::Finish(Err(Error::NoSpace)));
        };

        let current = pages.get_record(record_id)?;
        let version = match current {
            Some(current) if current.header.version == u16::MAX => {
                warn!("save record {}: version counter exhausted", record_id);
                return Ok(Action::Finish(Err(Error::NoSpace)));
            }
            Some(current) => current.header.version + 1,
            None => 1,
        };

        if let Some(current) = current
            && current.header.active
            && current.header.data_length() == self.data.len()
            && pages.read_data(&current)? == self.data
        {
            trace!("save record {}: unchanged", record_id);
            self.state = SaveState::Finish;
            return Ok(Action::Finish(Ok(())));
        }

        trace!(
            "save record {}: version {} to page {} @{}",
            record_id, version, page, offset
        );
        self.state = SaveState::Finish;
        Ok(Action::write(page, offset, build_record(record_id, version, &self.data)))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DeactivateState {
    Deactivate,
    Finish,
}

/// Clears the active flag of the current record in place, turning it into a tombstone.
#[derive(Debug)]
pub(crate) struct DeactivateRecord {
    state: DeactivateState,
}

impl DeactivateRecord {
    pub(crate) fn new() -> Self {
        Self {
            state: DeactivateState::Deactivate,
        }
    }

    fn advance<T: FlashQueue>(
        &mut self,
        record_id: u16,
        event: Event,
        pages: &mut Pages<'_, T>,
    ) -> Result<Action, Error> {
        if event == Event::TaskFailed {
            warn!("deactivate record {}: flash task failed", record_id);
            return Ok(Action::Finish(Err(Error::Busy)));
        }

        match self.state {
            DeactivateState::Deactivate => {
                debug!("deactivate record {}", record_id);
                self.state = DeactivateState::Finish;

                match pages.get_record(record_id)? {
                    Some(record) if record.header.active => Ok(Action::write(
                        record.page,
                        record.offset,
                        tombstone_header().to_vec(),
                    )),
                    _ => Ok(Action::Finish(Ok(()))),
                }
            }
            DeactivateState::Finish => Ok(Action::Finish(Ok(()))),
        }
    }
}

/// A queued record operation.
#[derive(Debug)]
pub(crate) enum RecordOperation {
    Save(SaveRecord),
    Deactivate(DeactivateRecord),
}

impl RecordOperation {
    pub(crate) fn advance<T: FlashQueue>(
        &mut self,
        record_id: u16,
        event: Event,
        pages: &mut Pages<'_, T>,
    ) -> Result<Action, Error> {
        match self {
            RecordOperation::Save(save) => save.advance(record_id, event, pages),
            RecordOperation::Deactivate(deactivate) => deactivate.advance(record_id, event, pages),
        }
    }
}
