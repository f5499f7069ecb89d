//! Shared fixtures for the integration tests: a small account aggregate and
//! a blob store wrapper that counts calls.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use blobfold_es::{
    AGGREGATE_KEY_METADATA, Aggregate, BlobStore, Command, CompositeIndex, Context, Envelope,
    EventStore, EventStoreBuilder, Handler, Keys, ListOptions, Subject, event_payload,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opened {
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposited {
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub amount: u64,
}

event_payload! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum AccountEvent {
        Opened(Opened),
        Deposited(Deposited),
        Withdrawn(Withdrawn),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("account is not open")]
    NotOpen,
    #[error("account is already open")]
    AlreadyOpen,
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: u64, requested: u64 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Account {
    pub owner: Option<String>,
    pub balance: u64,
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";

    type Event = AccountEvent;
    type Error = AccountError;

    fn evolve(
        &mut self,
        _ctx: &Context,
        event: &Envelope<AccountEvent>,
    ) -> Result<(), AccountError> {
        match &event.data {
            AccountEvent::Opened(e) => self.owner = Some(e.owner.clone()),
            AccountEvent::Deposited(e) => self.balance += e.amount,
            AccountEvent::Withdrawn(e) => {
                self.balance = self
                    .balance
                    .checked_sub(e.amount)
                    .ok_or(AccountError::InsufficientFunds {
                        balance: self.balance,
                        requested: e.amount,
                    })?;
            }
        }
        Ok(())
    }
}

pub struct Open(pub &'static str);

impl Command<Account> for Open {
    fn decide(
        &self,
        _subject: &dyn Subject,
        account: &Account,
    ) -> Result<Vec<AccountEvent>, AccountError> {
        if account.owner.is_some() {
            return Err(AccountError::AlreadyOpen);
        }
        Ok(vec![Opened { owner: self.0.into() }.into()])
    }
}

pub struct Deposit(pub u64);

impl Command<Account> for Deposit {
    fn decide(
        &self,
        _subject: &dyn Subject,
        account: &Account,
    ) -> Result<Vec<AccountEvent>, AccountError> {
        if account.owner.is_none() {
            return Err(AccountError::NotOpen);
        }
        if self.0 == 0 {
            return Ok(vec![]);
        }
        Ok(vec![Deposited { amount: self.0 }.into()])
    }
}

pub struct Withdraw(pub u64);

impl Command<Account> for Withdraw {
    fn decide(
        &self,
        _subject: &dyn Subject,
        account: &Account,
    ) -> Result<Vec<AccountEvent>, AccountError> {
        if account.balance < self.0 {
            return Err(AccountError::InsufficientFunds {
                balance: account.balance,
                requested: self.0,
            });
        }
        Ok(vec![Withdrawn { amount: self.0 }.into()])
    }
}

/// Wraps a blob store and counts every call.
pub struct CountingBlobStore<S> {
    inner: S,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub lists: AtomicUsize,
}

impl<S> CountingBlobStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
        }
    }

    pub fn total(&self) -> usize {
        [&self.gets, &self.puts, &self.deletes, &self.lists]
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }
}

impl<S: BlobStore> BlobStore for CountingBlobStore<S> {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, value)
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key)
    }

    fn list(&self, opts: &ListOptions) -> io::Result<Keys<'_>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list(opts)
    }
}

/// The three blob stores behind an account handler.
pub struct Stores {
    pub log: Arc<dyn BlobStore>,
    pub times: Arc<dyn BlobStore>,
    pub index: Arc<dyn BlobStore>,
}

/// An account event store and handler over `stores`.
pub fn account_handler(stores: &Stores) -> Handler<Account> {
    let index: Arc<CompositeIndex<String, AccountEvent>> = Arc::new(CompositeIndex::by_metadata(
        stores.index.clone(),
        AGGREGATE_KEY_METADATA,
    ));
    let store: EventStore<AccountEvent> = EventStoreBuilder::<AccountEvent>::new()
        .log(stores.log.clone())
        .time_index(stores.times.clone())
        .event::<Opened>("account.opened")
        .event::<Deposited>("account.deposited")
        .event::<Withdrawn>("account.withdrawn")
        .indexer(index.clone())
        .build();
    Handler::new(Arc::new(store), index)
}
