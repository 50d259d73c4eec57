use crate::error::Error;
use crate::internal::{Action, Event, Pages};
use crate::platform::{FlashQueue, TaskTag};
use crate::raw::{MAX_PAGE_VERSION, PAGE_HEADER_SIZE, PAGE_VERSION_WARN_THRESHOLD, PageHeader};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DefragmentState {
    /// Copy live records one by one to the swap page.
    MoveRecords,
    /// Activate the swap page with a version above every other active page.
    WritePageHeader,
    /// The swap page is active, the source page holds duplicates only.
    EraseOldPage,
    Finalize,
    /// The swap page is being erased again after the defragmentation failed.
    Failed(Error),
}

/// Compacts one active page into the swap page. The source page becomes the new swap page.
///
/// Until the swap page header is written every record still has its original copy, and afterwards
/// the copies carry the same versions as the originals, so a power loss at any point never loses
/// a record.
#[derive(Debug)]
pub(crate) struct Defragment {
    page: u16,
    swap_page: u16,
    state: DefragmentState,
    moved: u16,
    /// The machine that asked for the defragmentation and waits for it.
    pub(crate) requester: TaskTag,
    pub(crate) task_failed: bool,
}

impl Defragment {
    /// Returns `None` if there is no swap page or, unless `force` is set, nothing to reclaim.
    pub(crate) fn start<T: FlashQueue>(
        page: u16,
        force: bool,
        requester: TaskTag,
        pages: &mut Pages<'_, T>,
    ) -> Result<Option<Self>, Error> {
        let Some(swap_page) = pages.swap_page()? else {
            warn!("defragment page {}: no swap page", page);
            return Ok(None);
        };

        let free = pages.free_space_on_page(page)?;
        let free_after = pages.free_space_when_defragmented(page)?;
        if !force && free_after <= free {
            debug!("defragment page {}: nothing to reclaim", page);
            return Ok(None);
        }

        debug!(
            "defragment page {} into {}: {} bytes free, {} after",
            page, swap_page, free, free_after
        );
        Ok(Some(Self {
            page,
            swap_page,
            state: DefragmentState::MoveRecords,
            moved: 0,
            requester,
            task_failed: false,
        }))
    }

    pub(crate) fn advance<T: FlashQueue>(
        &mut self,
        event: Event,
        pages: &mut Pages<'_, T>,
    ) -> Result<Action, Error> {
        if event == Event::TaskFailed {
            return Ok(self.on_task_failed());
        }

        loop {
            match self.state {
                DefragmentState::MoveRecords => {
                    if let Some(action) = self.move_next_record(pages)? {
                        return Ok(action);
                    }
                    self.state = DefragmentState::WritePageHeader;
                }
                DefragmentState::WritePageHeader => {
                    let max = pages.max_active_version()?;
                    if max >= MAX_PAGE_VERSION {
                        error!("defragment page {}: page version counter exhausted", self.page);
                        self.state = DefragmentState::Failed(Error::NoSpace);
                        return Ok(Action::erase(self.swap_page));
                    }

                    let version = max + 1;
                    if version >= PAGE_VERSION_WARN_THRESHOLD {
                        warn!("page version counter {} close to its limit", version);
                    }

                    trace!("activate page {} with version {}", self.swap_page, version);
                    self.state = DefragmentState::EraseOldPage;
                    return Ok(Action::write(
                        self.swap_page,
                        0,
                        PageHeader::active(version).encode().to_vec(),
                    ));
                }
                DefragmentState::EraseOldPage => {
                    self.state = DefragmentState::Finalize;
                    return Ok(Action::erase(self.page));
                }
                DefragmentState::Finalize => {
                    debug!(
                        "defragment page {}: done, {} records moved to page {}",
                        self.page, self.moved, self.swap_page
                    );
                    return Ok(Action::Finish(Ok(())));
                }
                DefragmentState::Failed(e) => return Ok(Action::Finish(Err(e))),
            }
        }
    }

    fn on_task_failed(&mut self) -> Action {
        match self.state {
            DefragmentState::MoveRecords
            | DefragmentState::WritePageHeader
            | DefragmentState::EraseOldPage => {
                warn!("defragment page {}: write failed, discarding page {}", self.page, self.swap_page);
                self.state = DefragmentState::Failed(Error::Busy);
                Action::erase(self.swap_page)
            }
            DefragmentState::Finalize => {
                error!("defragment page {}: erase failed", self.page);
                Action::Finish(Err(Error::FlashError))
            }
            DefragmentState::Failed(_) => {
                error!("defragment page {}: erasing page {} failed", self.page, self.swap_page);
                Action::Finish(Err(Error::FlashError))
            }
        }
    }

    /// Issues the copy of the next live record that is not yet on the swap page.
    fn move_next_record<T: FlashQueue>(
        &mut self,
        pages: &mut Pages<'_, T>,
    ) -> Result<Option<Action>, Error> {
        let mut offset = PAGE_HEADER_SIZE;
        while let Some(record) = pages.record_at(self.page, offset)? {
            offset = record.next_offset();

            if !pages.is_live(&record)?
                || pages.contains_record(self.swap_page, record.header.record_id)?
            {
                continue;
            }

            let target = pages.chain_end(self.swap_page)?;
            trace!(
                "move record {} from page {} @{} to page {} @{}",
                record.header.record_id, self.page, record.offset, self.swap_page, target
            );
            self.moved += 1;
            return Ok(Some(Action::write(
                self.swap_page,
                target,
                pages.read_record(&record)?,
            )));
        }
        Ok(None)
    }
}
