use crate::error::Error;
use crate::platform::{FlashQueue, TaskTag};
use crate::repair::Repair;
use crate::{Completion, Listener, OperationKind, RebootReason, RecordStorage};
use alloc::vec::Vec;

/// Attempts at erasing the page pool before giving up.
const LOCK_DOWN_MAX_ATTEMPTS: u8 = 3;

#[derive(Debug)]
pub(crate) struct LockDown {
    pub(crate) owner: Listener,
    pub(crate) user_type: u32,
    attempts: u8,
    /// The pool erase is queued. Nothing else runs meanwhile.
    pub(crate) erasing: bool,
}

impl<T: FlashQueue> RecordStorage<T> {
    /// Cancels all pending work, erases every page of the pool and sets it up again.
    ///
    /// Pending operations complete with [`Error::LockDown`], and so does every later save or
    /// deactivation that does not come from `owner`. Once the pool has been set up again the
    /// owner receives a [`OperationKind::LockDown`] completion and a
    /// [`RebootReason::FactoryReset`] is requested.
    pub fn lock_down_and_clear_all_settings(
        &mut self,
        owner: Listener,
        user_type: u32,
    ) -> Result<(), Error> {
        if self.lock_down.is_some() {
            return Err(Error::LockDown);
        }

        warn!("lock down requested by listener {}, clearing all records", owner.0);
        for operation in self.queue.drain() {
            let completion = operation.into_completion(Err(Error::LockDown));
            self.publish(completion);
        }
        self.repair = None;
        self.defrag = None;

        self.lock_down = Some(LockDown {
            owner,
            user_type,
            attempts: 0,
            erasing: true,
        });
        self.erase_pool();
        Ok(())
    }

    fn erase_pool(&mut self) {
        let result =
            self.hal
                .erase_pages(self.layout.first_page, self.layout.num_pages, TaskTag::LockDown);
        if result.is_err() {
            self.on_lock_down_erased(result);
        }
    }

    pub(crate) fn on_lock_down_erased(&mut self, result: Result<(), Error>) {
        let Some(lock_down) = self.lock_down.as_mut() else {
            return;
        };
        if !lock_down.erasing {
            return;
        }

        match result {
            Ok(()) => {
                debug!("lock down: pool erased, setting up pages");
                lock_down.erasing = false;
                self.repair = Some(Repair::new(true));
            }
            Err(_e) => {
                lock_down.attempts += 1;
                if lock_down.attempts < LOCK_DOWN_MAX_ATTEMPTS {
                    warn!("lock down: erase failed ({}), attempt {}", _e, lock_down.attempts);
                    self.erase_pool();
                } else {
                    error!("lock down: erase failed {} times", lock_down.attempts);
                    self.finish_lock_down(Err(Error::Busy));
                    self.request_reboot(RebootReason::LockDownFailed);
                }
            }
        }
    }

    /// Notifies the owner of the lock-down. The storage stays locked down until the reboot.
    pub(crate) fn finish_lock_down(&mut self, result: Result<(), Error>) {
        let Some(lock_down) = self.lock_down.as_ref() else {
            return;
        };

        let completion = Completion {
            kind: OperationKind::LockDown,
            record_id: 0,
            result,
            listener: lock_down.owner,
            user_type: lock_down.user_type,
            user_data: Vec::new(),
        };
        self.publish(Some(completion));
    }
}
