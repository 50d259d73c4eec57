use crate::error::Error;
use crate::save::RecordOperation;
use crate::{Completion, Listener, OperationKind};
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Default number of bytes the operation queue may hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Bookkeeping bytes charged per queued operation on top of its payload.
pub(crate) const OPERATION_OVERHEAD: usize = 20;

/// A queued save or deactivate request.
#[derive(Debug)]
pub(crate) struct Operation {
    pub(crate) ticket: u32,
    pub(crate) record_id: u16,
    pub(crate) listener: Option<Listener>,
    pub(crate) user_type: u32,
    pub(crate) task_failed: bool,
    pub(crate) machine: RecordOperation,
}

impl Operation {
    fn cost(&self) -> usize {
        OPERATION_OVERHEAD
            + match &self.machine {
                RecordOperation::Save(save) => save.data.len() + save.user_data.len(),
                RecordOperation::Deactivate(_) => 0,
            }
    }

    pub(crate) fn kind(&self) -> OperationKind {
        match self.machine {
            RecordOperation::Save(_) => OperationKind::Save,
            RecordOperation::Deactivate(_) => OperationKind::Deactivate,
        }
    }

    /// The completion to publish, if the operation has a listener.
    pub(crate) fn into_completion(self, result: Result<(), Error>) -> Option<Completion> {
        let kind = self.kind();
        let listener = self.listener?;
        let user_data = match self.machine {
            RecordOperation::Save(save) => save.user_data,
            RecordOperation::Deactivate(_) => Vec::new(),
        };

        Some(Completion {
            kind,
            record_id: self.record_id,
            result,
            listener,
            user_type: self.user_type,
            user_data,
        })
    }
}

/// FIFO of pending operations with a byte budget. Only the front operation is ever executed.
#[derive(Debug)]
pub(crate) struct OperationQueue {
    operations: VecDeque<Operation>,
    capacity: usize,
    used: usize,
    next_ticket: u32,
}

impl OperationQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            operations: VecDeque::new(),
            capacity,
            used: 0,
            next_ticket: 0,
        }
    }

    /// Queues an operation and returns its ticket, or [`Error::Busy`] if the byte budget is
    /// exhausted.
    pub(crate) fn push(
        &mut self,
        record_id: u16,
        listener: Option<Listener>,
        user_type: u32,
        machine: RecordOperation,
    ) -> Result<u32, Error> {
        let operation = Operation {
            ticket: self.next_ticket,
            record_id,
            listener,
            user_type,
            task_failed: false,
            machine,
        };

        let ticket = operation.ticket;
        let cost = operation.cost();
        if self.used + cost > self.capacity {
            warn!(
                "operation queue full: {} of {} bytes used, {} requested",
                self.used, self.capacity, cost
            );
            return Err(Error::Busy);
        }

        self.used += cost;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.operations.push_back(operation);
        Ok(ticket)
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut Operation> {
        self.operations.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<Operation> {
        let operation = self.operations.pop_front()?;
        self.used -= operation.cost();
        Some(operation)
    }

    /// Removes every pending operation.
    pub(crate) fn drain(&mut self) -> VecDeque<Operation> {
        self.used = 0;
        core::mem::take(&mut self.operations)
    }

    pub(crate) fn len(&self) -> usize {
        self.operations.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::{DeactivateRecord, SaveRecord};
    use alloc::vec;
    use pretty_assertions::assert_eq;

    fn save(len: usize, user_data: usize) -> RecordOperation {
        RecordOperation::Save(SaveRecord::new(vec![0xAA; len], vec![0x55; user_data]))
    }

    #[test]
    fn operations_are_charged_with_overhead_and_payload() {
        let mut queue = OperationQueue::new(100);

        queue.push(1, None, 0, save(30, 10)).unwrap();
        assert_eq!(queue.used_bytes(), 60);

        queue
            .push(2, None, 0, RecordOperation::Deactivate(DeactivateRecord::new()))
            .unwrap();
        assert_eq!(queue.used_bytes(), 80);

        assert_eq!(queue.push(3, None, 0, save(1, 0)), Err(Error::Busy));
        assert_eq!(queue.len(), 2);

        queue.pop_front().unwrap();
        assert_eq!(queue.used_bytes(), 20);
        queue.push(3, None, 0, save(1, 0)).unwrap();
        assert_eq!(queue.used_bytes(), 41);
    }

    #[test]
    fn operations_run_in_fifo_order_with_unique_tickets() {
        let mut queue = OperationQueue::new(DEFAULT_QUEUE_CAPACITY);

        let first = queue.push(7, None, 0, save(4, 0)).unwrap();
        let second = queue.push(8, None, 0, save(4, 0)).unwrap();
        assert_ne!(first, second);

        assert_eq!(queue.front_mut().unwrap().record_id, 7);
        assert_eq!(queue.pop_front().unwrap().ticket, first);
        assert_eq!(queue.pop_front().unwrap().ticket, second);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_releases_the_budget() {
        let mut queue = OperationQueue::new(DEFAULT_QUEUE_CAPACITY);
        queue.push(1, None, 0, save(100, 0)).unwrap();
        queue.push(2, None, 0, save(100, 0)).unwrap();

        assert_eq!(queue.drain().len(), 2);
        assert_eq!(queue.used_bytes(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn completion_carries_user_data() {
        let mut queue = OperationQueue::new(DEFAULT_QUEUE_CAPACITY);
        queue
            .push(
                5,
                Some(Listener(3)),
                42,
                RecordOperation::Save(SaveRecord::new(vec![1], vec![9, 9])),
            )
            .unwrap();
        queue.push(6, None, 0, save(1, 0)).unwrap();

        let completion = queue.pop_front().unwrap().into_completion(Ok(())).unwrap();
        assert_eq!(
            completion,
            Completion {
                kind: OperationKind::Save,
                record_id: 5,
                result: Ok(()),
                listener: Listener(3),
                user_type: 42,
                user_data: vec![9, 9],
            }
        );

        // no listener, nothing to publish
        assert_eq!(queue.pop_front().unwrap().into_completion(Ok(())), None);
    }
}
