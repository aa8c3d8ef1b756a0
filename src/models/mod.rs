pub mod account;
pub mod event;
pub mod ledger_entry;
pub mod mutation;

pub use account::Account;
pub use event::{CheckoutSession, EventKind, EventParseError, ProviderEvent};
pub use ledger_entry::{EntryStatus, EntryType, LedgerEntry, NewEntry, Reason};
pub use mutation::{Direction, Mutation, MutationRow};
