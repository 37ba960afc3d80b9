pub mod accounts;
pub mod aggregator;
pub mod gate;
pub mod keys;
pub mod ledger;
pub mod selection;

pub use accounts::*;
pub use aggregator::*;
pub use gate::*;
pub use keys::*;
pub use ledger::*;
pub use selection::*;
