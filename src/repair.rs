use crate::error::Error;
use crate::internal::{Action, Event, Pages};
use crate::platform::FlashQueue;
use crate::raw::{MAX_PAGE_VERSION, PageHeader, PageState};

/// Flash failures tolerated during one repair run.
const REPAIR_RETRY_LIMIT: u8 = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RepairStage {
    EraseCorruptPages,
    EnsureSwapPage,
    ActivatePages,
    ValidateFreeSpace,
    Finalize,
}

/// Brings the page pool into a consistent state: no corrupt page, exactly one swap page, every
/// other page active and erased after its last record.
///
/// Each stage issues at most one flash task per step and re-evaluates the pool afterwards, so an
/// interrupted repair simply starts over on the next boot.
#[derive(Debug)]
pub(crate) struct Repair {
    stage: RepairStage,
    failures: u8,
    defragment_requests: u16,
    /// Set for the repair that follows a lock-down erase.
    pub(crate) after_lock_down: bool,
    pub(crate) task_failed: bool,
}

impl Repair {
    pub(crate) fn new(after_lock_down: bool) -> Self {
        Self {
            stage: RepairStage::EraseCorruptPages,
            failures: 0,
            defragment_requests: 0,
            after_lock_down,
            task_failed: false,
        }
    }

    pub(crate) fn advance<T: FlashQueue>(
        &mut self,
        event: Event,
        pages: &mut Pages<'_, T>,
    ) -> Result<Action, Error> {
        if event == Event::TaskFailed {
            self.failures += 1;
            if self.failures > REPAIR_RETRY_LIMIT {
                error!("repair: giving up after {} flash failures", self.failures);
                return Ok(Action::Finish(Err(Error::FlashError)));
            }
            // a half written page header turns into a corrupt page, start over
            warn!("repair: flash task failed, retry {}", self.failures);
            self.stage = RepairStage::EraseCorruptPages;
        }

        loop {
            match self.stage {
                RepairStage::EraseCorruptPages => {
                    for page in 0..pages.num_pages() {
                        if pages.page_state(page)? == PageState::Corrupt {
                            debug!("repair: erasing corrupt page {}", page);
                            return Ok(Action::erase(page));
                        }
                    }
                    self.stage = RepairStage::EnsureSwapPage;
                }
                RepairStage::EnsureSwapPage => {
                    if pages.swap_page()?.is_none()
                        && let Some((page, _version)) = Self::newest_page(pages)?
                    {
                        warn!(
                            "repair: no swap page, erasing page {} with version {}",
                            page, _version
                        );
                        return Ok(Action::erase(page));
                    }
                    self.stage = RepairStage::ActivatePages;
                }
                RepairStage::ActivatePages => {
                    if let Some(action) = Self::activate_next_page(pages)? {
                        return Ok(action);
                    }
                    self.stage = RepairStage::ValidateFreeSpace;
                }
                RepairStage::ValidateFreeSpace => {
                    if let Some(action) = self.validate_free_space(pages)? {
                        return Ok(action);
                    }
                    self.stage = RepairStage::Finalize;
                }
                RepairStage::Finalize => {
                    debug!("repair: done");
                    return Ok(Action::Finish(Ok(())));
                }
            }
        }
    }

    /// The active page with the highest version counter, the first one in pool order on ties.
    fn newest_page<T: FlashQueue>(pages: &mut Pages<'_, T>) -> Result<Option<(u16, u16)>, Error> {
        let mut newest: Option<(u16, u16)> = None;
        for page in 0..pages.num_pages() {
            let header = pages.page_header(page)?;
            if header.is_active() && newest.is_none_or(|(_, version)| header.version > version) {
                newest = Some((page, header.version));
            }
        }
        Ok(newest)
    }

    /// Activates the first empty page that is not the swap page.
    fn activate_next_page<T: FlashQueue>(
        pages: &mut Pages<'_, T>,
    ) -> Result<Option<Action>, Error> {
        let swap_page = pages.swap_page()?;

        for page in 0..pages.num_pages() {
            if Some(page) == swap_page || pages.page_state(page)? != PageState::Empty {
                continue;
            }

            let max = pages.max_active_version()?;
            if max >= MAX_PAGE_VERSION {
                error!("repair: page version counter exhausted, page {} stays empty", page);
                return Ok(None);
            }

            debug!("repair: activating page {} with version {}", page, max + 1);
            return Ok(Some(Action::write(
                page,
                0,
                PageHeader::active(max + 1).encode().to_vec(),
            )));
        }
        Ok(None)
    }

    /// Requests a forced defragmentation of the first active page with garbage after its last
    /// record. Gives up once every page could have been defragmented.
    fn validate_free_space<T: FlashQueue>(
        &mut self,
        pages: &mut Pages<'_, T>,
    ) -> Result<Option<Action>, Error> {
        for page in 0..pages.num_pages() {
            if !pages.is_active(page)? {
                continue;
            }

            let end = pages.chain_end(page)?;
            if pages.is_erased_from(page, end)? {
                continue;
            }

            if self.defragment_requests >= pages.num_pages() {
                warn!("repair: page {} still not erased after its last record", page);
                return Ok(None);
            }

            warn!("repair: page {} not erased after offset {}, defragmenting", page, end);
            self.defragment_requests += 1;
            return Ok(Some(Action::Defragment { page, force: true }));
        }
        Ok(None)
    }
}
