// Sigchain import, verification and key state caching
pub mod chain;

pub use chain::{
    import_link, verify_chain, ChainLink, ChainLinkError, KeyFamilyState, KeyStateCache,
    LoadError,
};
