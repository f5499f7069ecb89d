mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use blobfold_es::{BlobStore, Context, HandleError, MemoryBlobStore, ReadOptions, SystemSubject};
use common::{
    Account, AccountError, CountingBlobStore, Deposit, Open, Stores, Withdraw, account_handler,
};

fn memory_stores() -> Stores {
    Stores {
        log: Arc::new(MemoryBlobStore::new()),
        times: Arc::new(MemoryBlobStore::new()),
        index: Arc::new(MemoryBlobStore::new()),
    }
}

#[test]
fn account_lifecycle() {
    let handler = account_handler(&memory_stores());
    let subject = SystemSubject::new("teller");
    let ctx = Context::default();

    handler.handle(&subject, &ctx, "acc1", &Open("ann")).unwrap();
    handler.handle(&subject, &ctx, "acc1", &Deposit(100)).unwrap();
    let stored = handler.handle(&subject, &ctx, "acc1", &Withdraw(30)).unwrap();
    assert_eq!(stored[0].sequence, 3);
    assert_eq!(stored[0].discriminator, "account.withdrawn");

    let account = handler.aggregate(&subject, &ctx, "acc1").unwrap().unwrap();
    assert_eq!(
        account,
        Account {
            owner: Some("ann".into()),
            balance: 70,
        }
    );

    let err = handler
        .handle(&subject, &ctx, "acc1", &Withdraw(500))
        .expect_err("overdraft is rejected");
    assert!(matches!(
        err,
        HandleError::Domain(AccountError::InsufficientFunds {
            balance: 70,
            requested: 500
        })
    ));
}

#[test]
fn no_op_command_performs_no_storage_io() {
    let log = Arc::new(CountingBlobStore::new(MemoryBlobStore::new()));
    let times = Arc::new(CountingBlobStore::new(MemoryBlobStore::new()));
    let index = Arc::new(CountingBlobStore::new(MemoryBlobStore::new()));
    let handler = account_handler(&Stores {
        log: log.clone(),
        times: times.clone(),
        index: index.clone(),
    });
    let subject = SystemSubject::default();
    let ctx = Context::default();

    handler.handle(&subject, &ctx, "acc", &Open("bob")).unwrap();
    // Warm the cache: this replay reads the log once.
    handler.aggregate(&subject, &ctx, "acc").unwrap();
    let before = log.total() + times.total() + index.total();

    let stored = handler.handle(&subject, &ctx, "acc", &Deposit(0)).unwrap();
    assert!(stored.is_empty());
    assert_eq!(log.total() + times.total() + index.total(), before);
    assert_eq!(log.puts.load(Ordering::SeqCst), 1);
}

#[test]
fn many_accounts_in_parallel() {
    let handler = Arc::new(account_handler(&memory_stores()));
    let joins: Vec<_> = (0..6)
        .map(|n| {
            let handler = handler.clone();
            std::thread::spawn(move || {
                let subject = SystemSubject::default();
                let ctx = Context::default();
                let key = format!("acc{n}");
                handler.handle(&subject, &ctx, &key, &Open("owner")).unwrap();
                for _ in 0..20 {
                    handler.handle(&subject, &ctx, &key, &Deposit(5)).unwrap();
                }
            })
        })
        .collect();
    for join in joins {
        join.join().unwrap();
    }

    let subject = SystemSubject::default();
    let ctx = Context::default();
    for n in 0..6 {
        let account = handler
            .aggregate(&subject, &ctx, &format!("acc{n}"))
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, 100);
    }

    let counts: Vec<(String, usize)> = handler
        .index()
        .group_by_primary_as_string()
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(counts.len(), 6);
    assert!(counts.iter().all(|(_, n)| *n == 21));

    let all: Vec<u64> = handler
        .store()
        .read_all(&subject, ReadOptions::default())
        .unwrap()
        .map(|e| e.unwrap().sequence)
        .collect();
    assert_eq!(all, (1..=126).collect::<Vec<_>>());
}

#[test]
fn export_moves_an_account_between_stores() {
    let source = account_handler(&memory_stores());
    let subject = SystemSubject::default();
    let ctx = Context::default();
    source.handle(&subject, &ctx, "old", &Open("cy")).unwrap();
    source.handle(&subject, &ctx, "old", &Deposit(40)).unwrap();

    let doc = source
        .store()
        .export_primary(&subject, source.index(), &"old".to_string())
        .unwrap();
    let json = serde_json::to_vec(&doc).unwrap();

    let target_stores = memory_stores();
    let target = account_handler(&target_stores);
    let imported = target
        .import(&subject, &ctx, "new", &serde_json::from_slice(&json).unwrap())
        .unwrap();
    assert_eq!(imported.balance, 40);
    assert!(target_stores.log.get("000000000002").unwrap().is_some());

    target.handle(&subject, &ctx, "new", &Deposit(2)).unwrap();
    assert_eq!(
        target.aggregate(&subject, &ctx, "new").unwrap().unwrap().balance,
        42
    );
}
