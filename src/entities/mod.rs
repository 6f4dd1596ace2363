// Entity Models
//
// Owners (companies, sectors) and the ledger entries that accumulate against them.
// Both claim streams share these types; OwnerKind tells them apart.

pub mod entry;
pub mod owner;

pub use entry::{
    default_exchange_rate, default_rate, ClaimInput, CorrelationKey, EntryId, EntryPatch,
    EntrySnapshot, LedgerEntry,
};
pub use owner::{Owner, OwnerId, OwnerKind};
