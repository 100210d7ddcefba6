//! External collaborators consumed by bridge sessions.

pub mod historical;

pub use historical::{
    HistoricalContextProvider, InMemoryContextProvider, ProviderError, SymbolAvailability,
};
