//! State machine, namespace bookkeeping and ledger properties.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use common::{id, Call, TestPool, POOL_SIZE};
use crossbeam_channel::bounded;
use pool_config::testing::TestEnvironment;
use pool_config::DiskSpace;
use pool_repository::{
    FileAttributes, OpenFlags, ReplicaEvent, ReplicaState, RepositoryError,
};

fn legal(from: ReplicaState, to: ReplicaState) -> bool {
    use ReplicaState::*;
    matches!(from, Precious | Cached | Broken) && matches!(to, Removed | Cached | Precious | Broken)
}

#[test]
fn test_remove_is_idempotent() {
    let pool = TestPool::new();
    pool.write(&id("01"), 32, ReplicaState::Precious);

    pool.repo.set_state(&id("01"), ReplicaState::Removed).unwrap();
    pool.repo.set_state(&id("01"), ReplicaState::Removed).unwrap();
    assert_eq!(pool.repo.get_state(&id("01")).unwrap(), ReplicaState::New);

    pool.repo.set_state(&id("FF"), ReplicaState::Removed).unwrap();
    assert_eq!(pool.repo.account().used(), 0);
    assert_eq!(pool.repo.account().precious(), 0);
}

#[test]
fn test_transition_law() {
    let pool = TestPool::new();
    let origins = [ReplicaState::Precious, ReplicaState::Cached, ReplicaState::Broken];

    for (n, from) in origins.into_iter().enumerate() {
        for to in ReplicaState::ALL {
            let replica = id(&format!("{:02X}", n * 16 + to as usize));
            pool.write(&replica, 8, ReplicaState::Precious);
            if from != ReplicaState::Precious {
                pool.repo.set_state(&replica, from).unwrap();
            }

            let result = pool.repo.set_state(&replica, to);
            if legal(from, to) {
                result.unwrap();
                let expected = if to == ReplicaState::Removed { ReplicaState::New } else { to };
                assert_eq!(pool.repo.get_state(&replica).unwrap(), expected);
            } else {
                assert!(
                    matches!(result, Err(RepositoryError::IllegalTransition { .. })),
                    "{} -> {} must be rejected",
                    from,
                    to
                );
                assert_eq!(pool.repo.get_state(&replica).unwrap(), from);
            }
        }
    }
    pool.repo.account().check_invariants().unwrap();
}

#[test]
fn test_transfer_states_are_not_reachable_through_set_state() {
    let pool = TestPool::new();
    let handle = pool
        .repo
        .create_entry(
            FileAttributes::new(id("10")),
            ReplicaState::FromClient,
            ReplicaState::Cached,
            Vec::new(),
            OpenFlags::NONE,
        )
        .unwrap();

    for to in [ReplicaState::Cached, ReplicaState::Precious, ReplicaState::Removed] {
        assert!(matches!(
            pool.repo.set_state(&id("10"), to),
            Err(RepositoryError::IllegalTransition { from: ReplicaState::FromClient, .. })
        ));
    }
    assert!(matches!(
        pool.repo.set_state(&id("11"), ReplicaState::Cached),
        Err(RepositoryError::IllegalTransition { from: ReplicaState::New, .. })
    ));
    handle.close().unwrap();
}

#[test]
fn test_create_entry_validates_states() {
    let pool = TestPool::new();
    let create = |transfer, target| {
        pool.repo.create_entry(
            FileAttributes::new(id("12")),
            transfer,
            target,
            Vec::new(),
            OpenFlags::NONE,
        )
    };
    assert!(matches!(
        create(ReplicaState::Cached, ReplicaState::Cached),
        Err(RepositoryError::InvalidArgument(_))
    ));
    assert!(matches!(
        create(ReplicaState::FromStore, ReplicaState::Broken),
        Err(RepositoryError::InvalidArgument(_))
    ));
}

#[test]
fn test_duplicate_entry_reregisters_location() {
    let pool = TestPool::new();
    pool.write(&id("20"), 4, ReplicaState::Cached);
    assert_eq!(pool.namespace.count(&Call::AddLocation(id("20"))), 1);

    let result = pool.repo.create_entry(
        FileAttributes::new(id("20")),
        ReplicaState::FromPool,
        ReplicaState::Cached,
        Vec::new(),
        OpenFlags::NONE,
    );
    assert!(matches!(result, Err(RepositoryError::DuplicateEntry(_))));
    assert_eq!(pool.namespace.count(&Call::AddLocation(id("20"))), 2);
    assert_eq!(pool.repo.get_state(&id("20")).unwrap(), ReplicaState::Cached);
}

#[test]
fn test_unknown_replica_clears_stale_location() {
    let pool = TestPool::new();

    let open = pool.repo.open_entry(&id("30"), OpenFlags::NONE);
    assert!(matches!(open, Err(RepositoryError::FileNotInCache { .. })));
    let sticky = pool.repo.set_sticky(&id("31"), "owner", None, false);
    assert!(matches!(sticky, Err(RepositoryError::FileNotInCache { .. })));

    assert_eq!(
        pool.namespace.calls(),
        vec![Call::ClearLocation(id("30")), Call::ClearLocation(id("31"))]
    );
    assert!(matches!(
        pool.repo.get_entry(&id("30")),
        Err(RepositoryError::FileNotInCache { .. })
    ));
    assert_eq!(pool.repo.get_state(&id("30")).unwrap(), ReplicaState::New);
}

#[test]
fn test_location_clearing_is_retried_on_timeout() {
    let pool = TestPool::new();
    pool.write(&id("40"), 4, ReplicaState::Cached);
    pool.namespace.clear_timeouts.store(2, Ordering::SeqCst);

    pool.repo.set_state(&id("40"), ReplicaState::Removed).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while pool.namespace.count(&Call::ClearLocation(id("40"))) < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pool.namespace.count(&Call::ClearLocation(id("40"))), 3);
    assert_eq!(pool.namespace.clear_timeouts.load(Ordering::SeqCst), 0);
}

#[test]
fn test_sticky_rules() {
    let pool = TestPool::new();
    pool.write(&id("50"), 4, ReplicaState::Precious);
    let later = SystemTime::now() + Duration::from_secs(600);
    let sooner = SystemTime::now() + Duration::from_secs(60);

    pool.repo.set_sticky(&id("50"), "a", Some(later), false).unwrap();
    pool.repo.set_sticky(&id("50"), "a", Some(sooner), false).unwrap();
    let sticky = pool.repo.get_entry(&id("50")).unwrap().sticky;
    assert_eq!(sticky.len(), 1);
    assert_eq!(sticky[0].expires_at, Some(later));

    pool.repo.set_sticky(&id("50"), "a", Some(sooner), true).unwrap();
    assert_eq!(pool.repo.get_entry(&id("50")).unwrap().sticky[0].expires_at, Some(sooner));

    pool.repo.set_sticky(&id("50"), "b", None, false).unwrap();
    assert_eq!(pool.repo.get_entry(&id("50")).unwrap().sticky.len(), 2);

    pool.repo
        .set_sticky(&id("50"), "a", Some(SystemTime::now()), false)
        .unwrap();
    let owners: Vec<String> = pool
        .repo
        .get_entry(&id("50"))
        .unwrap()
        .sticky
        .into_iter()
        .map(|r| r.owner)
        .collect();
    assert_eq!(owners, vec!["b"]);

    assert!(matches!(
        pool.repo.set_sticky(&id("50"), "", None, false),
        Err(RepositoryError::InvalidArgument(_))
    ));
}

#[test]
fn test_sticky_rejected_for_incomplete_replica() {
    let pool = TestPool::new();
    let handle = pool
        .repo
        .create_entry(
            FileAttributes::new(id("51")),
            ReplicaState::FromStore,
            ReplicaState::Precious,
            Vec::new(),
            OpenFlags::NONE,
        )
        .unwrap();
    assert!(matches!(
        pool.repo.set_sticky(&id("51"), "owner", None, false),
        Err(RepositoryError::FileNotInCache { .. })
    ));
    handle.close().unwrap();
}

#[test]
fn test_removability_follows_state_and_sticky() {
    let pool = TestPool::new();
    pool.write(&id("60"), 100, ReplicaState::Precious);
    let account = pool.repo.account();
    assert_eq!(account.precious(), 100);
    assert_eq!(account.removable(), 0);

    pool.repo.set_state(&id("60"), ReplicaState::Cached).unwrap();
    assert_eq!(account.precious(), 0);
    assert_eq!(account.removable(), 100);

    pool.repo.set_sticky(&id("60"), "pin", None, false).unwrap();
    assert_eq!(account.removable(), 0);

    pool.repo
        .set_sticky(&id("60"), "pin", Some(SystemTime::now()), true)
        .unwrap();
    assert_eq!(account.removable(), 100);
    assert!(pool.repo.space_record().lru_age < Duration::from_secs(60));

    pool.repo.set_state(&id("60"), ReplicaState::Removed).unwrap();
    assert_eq!(account.removable(), 0);
    assert_eq!(account.used(), 0);
}

#[test]
fn test_ledger_invariants_hold_under_concurrency() {
    let pool = Arc::new(TestPool::new());
    let workers: Vec<_> = (0..8)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let replica = id(&format!("{:X}{:02X}", t + 1, i));
                    let target = if i % 2 == 0 { ReplicaState::Cached } else { ReplicaState::Precious };
                    pool.write(&replica, 64 + i, target);
                    if i % 3 == 0 {
                        pool.repo.set_state(&replica, ReplicaState::Removed).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let account = pool.repo.account();
    account.check_invariants().unwrap();
    let space = pool.repo.space_record();
    assert!(space.precious <= space.used());
    assert!(space.removable <= space.used());

    let expected: u64 = pool
        .repo
        .list()
        .unwrap()
        .iter()
        .map(|r| pool.repo.get_entry(r).unwrap().size)
        .sum();
    assert_eq!(account.used(), expected);
}

#[test]
fn test_listener_failures_do_not_stop_delivery() {
    let pool = TestPool::new();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    pool.repo
        .add_listener(Arc::new(|_: &ReplicaEvent| -> anyhow::Result<()> {
            anyhow::bail!("listener failure")
        }));
    pool.repo
        .add_listener(Arc::new(|_: &ReplicaEvent| -> anyhow::Result<()> {
            panic!("listener panic")
        }));
    let listener = pool
        .repo
        .add_listener(Arc::new(move |_: &ReplicaEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

    pool.write(&id("70"), 4, ReplicaState::Precious);
    pool.drain_events(Duration::from_millis(100));
    let seen = delivered.load(Ordering::SeqCst);
    assert!(seen >= 2);

    assert!(pool.repo.remove_listener(listener));
    pool.repo.set_state(&id("70"), ReplicaState::Cached).unwrap();
    pool.drain_events(Duration::from_millis(100));
    assert_eq!(delivered.load(Ordering::SeqCst), seen);
}

#[test]
fn test_events_for_one_replica_arrive_in_order() {
    let pool = TestPool::new();
    pool.write(&id("71"), 4, ReplicaState::Precious);
    pool.repo.set_state(&id("71"), ReplicaState::Cached).unwrap();
    pool.repo.set_state(&id("71"), ReplicaState::Removed).unwrap();

    let transitions: Vec<(ReplicaState, ReplicaState)> = pool
        .drain_events(Duration::from_millis(100))
        .iter()
        .filter_map(|e| e.states())
        .collect();
    assert_eq!(
        transitions,
        vec![
            (ReplicaState::New, ReplicaState::FromClient),
            (ReplicaState::FromClient, ReplicaState::Precious),
            (ReplicaState::Precious, ReplicaState::Cached),
            (ReplicaState::Cached, ReplicaState::Removed),
            (ReplicaState::Removed, ReplicaState::Destroyed),
        ]
    );
}

#[test]
fn test_admin_commands() {
    let pool = TestPool::new();
    pool.write(&id("80"), 12, ReplicaState::Precious);
    pool.write(&id("81"), 12, ReplicaState::Cached);

    let listing = pool.repo.admin("rep ls");
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("80 <-P---------L(0)(0)> 12"));
    assert!(lines[1].starts_with("81 <C-------X--L(0)(0)> 12"));

    assert!(pool.repo.admin("rep rm 80").starts_with("Rejected:"));
    assert!(pool.repo.admin("rep rm 81").starts_with("Rejected:"));
    pool.repo.admin("rep set sticky 81 off --owner self");
    assert_eq!(pool.repo.admin("rep sticky ls 81"), "");
    assert_eq!(pool.repo.admin("rep rm 81"), "Removed 81");
    assert_eq!(pool.repo.admin("rep rm 80 --force"), "Removed 80");

    assert_eq!(pool.repo.admin("set max-diskspace 512k"), "");
    assert_eq!(pool.repo.space_record().total, 512 << 10);
    let info = pool.repo.admin("info");
    assert!(info.starts_with("State : OPEN\nFiles : 0"));
    assert!(info.contains("Runtime configured   : 512k"));
    assert!(pool.repo.admin("rep set frozen 80").starts_with("Syntax error:"));
    assert!(pool.repo.admin("set max diskspace 1g").starts_with("Syntax error:"));
    assert!(pool.repo.admin("rep --help").contains("sticky"));
}

#[test]
fn test_slow_listener_does_not_stall_mutators() {
    let mut env = TestEnvironment::new().unwrap();
    env.config.repository.max_diskspace = Some(DiskSpace::Bytes(POOL_SIZE));
    env.config.repository.notification_queue_capacity = 1;
    let pool = TestPool::with_env(env);
    pool.repo.load().unwrap();
    let target = id("90");
    pool.write(&target, 8, ReplicaState::Precious);

    // The listener reads back from the repository while mutations continue.
    let reader = pool.repo.clone();
    let listener = pool
        .repo
        .add_listener(Arc::new(move |event: &ReplicaEvent| -> anyhow::Result<()> {
            if let ReplicaEvent::StickyChanged { entry, .. } = event {
                thread::sleep(Duration::from_millis(250));
                reader.get_entry(&entry.id)?;
            }
            Ok(())
        }));

    let (done_tx, done_rx) = bounded(1);
    let writer = pool.repo.clone();
    let pinned = target.clone();
    thread::spawn(move || {
        for owner in ["a", "b", "c", "d"] {
            writer.set_sticky(&pinned, owner, None, true).unwrap();
        }
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(Duration::from_millis(500)).is_ok());
    assert_eq!(pool.repo.get_entry(&target).unwrap().sticky.len(), 4);
    assert!(pool.repo.remove_listener(listener));
}
