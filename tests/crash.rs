mod common;

use common::*;
use record_storage::error::Error;
use record_storage::{Config, Listener, NorFlashQueue, PageState, RecordStorage};
use std::collections::BTreeMap;

const NUM_PAGES: u16 = 3;
const RECORD_IDS: u16 = 3;

#[derive(Debug, Clone)]
enum Step {
    Save(u16, Vec<u8>),
    Deactivate(u16),
}

/// Overwrites three 64 byte records often enough to run through several defragmentations.
fn workload() -> Vec<Step> {
    let mut steps = Vec::new();
    for round in 0..8u8 {
        for record_id in 0..RECORD_IDS {
            steps.push(Step::Save(record_id, vec![round * 16 + record_id as u8; 56]));
        }
        if round == 3 {
            steps.push(Step::Deactivate(1));
        }
        if round == 5 {
            steps.push(Step::Deactivate(2));
            steps.push(Step::Deactivate(2));
        }
    }
    steps
}

/// What a record may look like after a restart: the last acknowledged value, or any value that
/// was attempted afterwards. `None` stands for a missing or deactivated record.
#[derive(Debug, Default)]
struct Expected {
    acknowledged: Option<Vec<u8>>,
    attempted: Vec<Option<Vec<u8>>>,
}

impl Expected {
    fn allows(&self, actual: &Option<Vec<u8>>) -> bool {
        self.acknowledged == *actual || self.attempted.contains(actual)
    }
}

/// Runs the workload until the power is cut, returns the expectations per record.
fn run_workload(flash: &mut Flash) -> BTreeMap<u16, Expected> {
    let mut expected: BTreeMap<u16, Expected> = (0..RECORD_IDS)
        .map(|record_id| (record_id, Expected::default()))
        .collect();

    let mut storage =
        RecordStorage::new(Config::new(0, NUM_PAGES), NorFlashQueue::new(flash)).unwrap();
    storage.run_until_idle();

    for step in workload() {
        let (record_id, value) = match &step {
            Step::Save(record_id, data) => {
                storage
                    .save_record(*record_id, data, Some(Listener(1)), 0)
                    .unwrap();
                (*record_id, Some(data.clone()))
            }
            Step::Deactivate(record_id) => {
                storage
                    .deactivate_record(*record_id, Some(Listener(1)), 0)
                    .unwrap();
                (*record_id, None)
            }
        };
        storage.run_until_idle();

        let completion = storage.poll_completion().unwrap();
        assert!(storage.poll_completion().is_none());

        let entry = expected.get_mut(&record_id).unwrap();
        if completion.result.is_ok() {
            entry.acknowledged = value;
            entry.attempted.clear();
        } else {
            entry.attempted.push(value);
        }
    }

    expected
}

fn check_pool(storage: &mut Storage<'_>) {
    let stats = storage.statistics().unwrap();
    assert_eq!(stats.pages.empty, 1, "{stats:?}");
    assert_eq!(stats.pages.corrupt, 0, "{stats:?}");
    assert_eq!(stats.pages.active, NUM_PAGES - 1, "{stats:?}");

    let mut versions: Vec<u16> = stats.pages_detail.iter().filter_map(|page| page.version).collect();
    versions.sort();
    versions.dedup();
    assert_eq!(versions.len(), NUM_PAGES as usize - 1, "{stats:?}");

    let swap_pages = stats
        .pages_detail
        .iter()
        .filter(|page| page.state == PageState::Empty)
        .count();
    assert_eq!(swap_pages, 1, "{stats:?}");
}

fn check_records(storage: &mut Storage<'_>, expected: &BTreeMap<u16, Expected>, context: &str) {
    for (record_id, entry) in expected {
        let actual = read(storage, *record_id);
        assert!(
            entry.allows(&actual),
            "{context}, record {record_id}: {actual:?} not in {entry:?}"
        );
    }
}

fn read(storage: &mut Storage<'_>, record_id: u16) -> Option<Vec<u8>> {
    match storage.get_record_data(record_id) {
        Ok(data) => Some(data),
        Err(Error::RecordNotFound) => None,
        Err(e) => panic!("record {record_id}: {e:?}"),
    }
}

#[test]
fn workload_without_power_loss() {
    let mut flash: Flash = Flash::new(NUM_PAGES as usize);
    let expected = run_workload(&mut flash);

    for entry in expected.values() {
        assert!(entry.attempted.is_empty(), "{expected:?}");
    }
    assert!(flash.erases() > 0);

    let mut storage = init(&mut flash, NUM_PAGES);
    check_pool(&mut storage);
    assert_eq!(read(&mut storage, 0), Some(vec![7 * 16; 56]));
    assert_eq!(read(&mut storage, 1), Some(vec![7 * 16 + 1; 56]));
    assert_eq!(read(&mut storage, 2), Some(vec![7 * 16 + 2; 56]));
}

#[test]
fn power_loss_at_every_flash_operation() {
    let mut reference: Flash = Flash::new(NUM_PAGES as usize);
    run_workload(&mut reference);
    let mutations = reference.operations.len();

    for cut in 0..mutations {
        println!("power cut after {cut} of {mutations} flash operations");

        let mut flash: Flash = Flash::new(NUM_PAGES as usize);
        flash.cut_power_after(cut);
        let expected = run_workload(&mut flash);
        assert!(!flash.is_powered(), "cut {cut}");

        flash.restore_power();
        let mut storage = init(&mut flash, NUM_PAGES);
        check_pool(&mut storage);

        check_records(&mut storage, &expected, &format!("cut {cut}"));

        // the pool keeps working after the repair
        storage
            .save_record(RECORD_IDS, b"after restart", Some(Listener(2)), 0)
            .unwrap();
        storage.run_until_idle();
        assert_eq!(storage.poll_completion().unwrap().result, Ok(()), "cut {cut}");
        assert_eq!(read(&mut storage, RECORD_IDS), Some(b"after restart".to_vec()));
    }
}

#[test]
fn power_loss_during_the_repair_after_a_power_loss() {
    let mut reference: Flash = Flash::new(NUM_PAGES as usize);
    run_workload(&mut reference);
    let mutations = reference.operations.len();
    let mut checked = 0;

    for cut in 0..mutations {
        let mut flash: Flash = Flash::new(NUM_PAGES as usize);
        flash.cut_power_after(cut);
        let expected = run_workload(&mut flash);
        flash.restore_power();
        let image = flash.buf.clone();

        // the repair is deterministic, an undisturbed run tells how many mutations it needs
        let before = flash.operations.len();
        drop(init(&mut flash, NUM_PAGES));
        let repair_mutations = flash.operations.len() - before;

        for second_cut in 0..repair_mutations {
            println!("power cut after {cut} flash operations and after {second_cut} of the repair");

            flash.buf.copy_from_slice(&image);
            flash.cut_power_after(second_cut);
            let mut storage =
                RecordStorage::new(Config::new(0, NUM_PAGES), NorFlashQueue::new(&mut flash))
                    .unwrap();
            storage.run_until_idle();
            drop(storage);
            assert!(!flash.is_powered(), "cut {cut}/{second_cut}");

            flash.restore_power();
            let mut storage = init(&mut flash, NUM_PAGES);
            check_pool(&mut storage);
            check_records(&mut storage, &expected, &format!("cut {cut}/{second_cut}"));
            checked += 1;
        }
    }

    println!("{checked} power cuts during a repair");
    assert!(checked > 0);
}
